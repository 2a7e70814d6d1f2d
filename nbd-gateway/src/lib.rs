use lazy_static::lazy_static;
use log::{debug, warn};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use gcs_store::config::Config;
use gcs_store::device::{Device, DeviceError};
use gcs_store::error::StoreError;
use gcs_store::metrics::start_http_server;
use gcs_store::multilock::MultiLock;
use gcs_store::store::gcs::GcsStore;
use nbdkit::*;

lazy_static! {
    static ref CONFIG: Mutex<Config> = Mutex::new(Config::default());
    static ref METRICS_ADDR: Mutex<Option<SocketAddr>> = Mutex::new(None);
    // One per-object-key mutex for the whole process, shared by every
    // connection, so concurrent read-modify-write cycles on the same block
    // serialise across connections too.
    static ref OBJ_LOCK: Arc<MultiLock> = Arc::new(MultiLock::new());
}

/// Handles NBD requests for one client connection.
#[derive(Default)]
struct GcsGateway {
    // The nbdkit 0.2 binding gives open() no way to fail; a handle whose
    // store could not be constructed stays None and fails per-operation.
    device: Option<Device<GcsStore>>,
}

impl GcsGateway {
    fn device(&self) -> Result<&Device<GcsStore>> {
        self.device
            .as_ref()
            .ok_or_else(|| Error::new(libc::EIO, "Object store client was not connected"))
    }
}

/// Map an engine error to the errno reported to the NBD client.
fn nbd_error(operation: &str, error: DeviceError) -> Error {
    let errno = match &error {
        DeviceError::Store(StoreError::Timeout) => {
            debug!("object store connection timed out on {}()", operation);
            libc::ETIMEDOUT
        }
        DeviceError::ReadOnly => libc::EROFS,
        _ => libc::EIO,
    };
    Error::new(errno, format!("Error in {}: {}", operation, error))
}

const CONFIG_HELP: &'static str = "\
Configuration options (pass KEY=VALUE on command line):
    bucket: name of the bucket holding the device objects (required)
    key: object name prefix for the device (required)
    json-credentials: path to a credentials file for non-default auth
    size: device size in bytes; requires object-size
    object-size: size of one stored object in bytes; requires size
    metrics: address on which to serve metrics in Prometheus format

Without size/object-size the device exposes the single object named by
`key`, read-only.
";

impl Server for GcsGateway {
    fn description() -> Option<&'static str> {
        Some("Network Block Device gateway for Google Cloud Storage")
    }

    fn config_help() -> Option<&'static str> {
        Some(CONFIG_HELP)
    }

    fn name() -> &'static str {
        "gcs-store-nbd-gateway"
    }

    fn config(key: &str, value: &str) -> Result<()> {
        if key == "metrics" {
            let addr = value
                .parse()
                .map_err(|_| Error::new(libc::EINVAL, "Invalid address for the metrics"))?;
            *METRICS_ADDR.lock().unwrap() = Some(addr);
            return Ok(());
        }
        CONFIG
            .lock()
            .unwrap()
            .set(key, value)
            .map_err(|e| Error::new(libc::EINVAL, e.to_string()))
    }

    fn config_complete() -> Result<()> {
        {
            let mut logger_builder = env_logger::builder();
            if let Ok(val) = std::env::var("GCS_STORE_LOG") {
                logger_builder.parse_filters(&val);
            }
            if let Ok(val) = std::env::var("GCS_STORE_LOG_STYLE") {
                logger_builder.parse_write_style(&val);
            }
            logger_builder.init();
        }

        CONFIG
            .lock()
            .unwrap()
            .validate()
            .map_err(|e| Error::new(libc::EINVAL, e.to_string()))?;

        if let Some(addr) = *METRICS_ADDR.lock().unwrap() {
            start_http_server(addr);
        }

        Ok(())
    }

    fn open(_readonly: bool) -> Box<dyn Server> {
        let config = CONFIG.lock().unwrap().clone();
        // Both options were checked by validate() in config_complete.
        let bucket = config.bucket.clone().unwrap();
        let key_prefix = config.key_prefix.clone().unwrap();

        let device = match GcsStore::connect(bucket, config.credentials()) {
            Ok(store) => Some(Device::new(
                store,
                key_prefix,
                config.layout(),
                OBJ_LOCK.clone(),
            )),
            Err(e) => {
                warn!("Error connecting to the object store: {}", e);
                None
            }
        };
        Box::new(GcsGateway { device })
    }

    fn thread_model() -> Result<ThreadModel>
    where
        Self: Sized,
    {
        Ok(ThreadModel::Parallel)
    }

    fn get_size(&self) -> Result<i64> {
        let size = self
            .device()?
            .size()
            .map_err(|e| nbd_error("get_size", e))?;
        Ok(size as i64)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.device()?
            .pread(buf, offset)
            .map_err(|e| nbd_error("pread", e))
    }

    fn write_at(&self, buf: &[u8], offset: u64, _flags: Flags) -> Result<()> {
        // FUA can be ignored: every write is flushed before PUT returns.
        self.device()?
            .pwrite(buf, offset)
            .map_err(|e| nbd_error("pwrite", e))
    }

    fn zero(&self, count: u32, offset: u64, _flags: Flags) -> Result<()> {
        self.device()?
            .zero(count as u64, offset)
            .map_err(|e| nbd_error("zero", e))
    }

    fn trim(&self, count: u32, offset: u64, _flags: Flags) -> Result<()> {
        self.device()?
            .trim(count as u64, offset)
            .map_err(|e| nbd_error("trim", e))
    }

    fn flush(&self) -> Result<()> {
        // Flush is implicitly done on every request.
        Ok(())
    }

    fn can_write(&self) -> Result<bool> {
        Ok(CONFIG.lock().unwrap().object_size.is_some())
    }

    fn can_multi_conn(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_trim(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_zero(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_fast_zero(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_flush(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_fua(&self) -> Result<FuaFlags> {
        Ok(FuaFlags::Native)
    }

    fn can_cache(&self) -> Result<CacheFlags> {
        Ok(CacheFlags::None)
    }
}

plugin!(GcsGateway {
    thread_model,
    config,
    config_complete,
    write_at,
    zero,
    trim,
    flush,
    can_write,
    can_multi_conn,
    can_trim,
    can_zero,
    can_fast_zero,
    can_flush,
    can_fua,
    can_cache
});
