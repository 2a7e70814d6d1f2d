use clap::{Arg, Command};
use std::borrow::Cow;
use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};

use gcs_store::store::auth::Credentials;
use gcs_store::store::gcs::GcsStore;
use gcs_store::store::ObjectStore;

fn main() {
    // Parse command line
    let mut cli = Command::new("gcs-store")
        .bin_name("gcs-store")
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("verbose")
                .short('v')
                .help("Augment verbosity (print more details)")
                .multiple_occurrences(true)
        )
        .arg(
            Arg::new("bucket")
                .long("bucket")
                .help("Name of the bucket")
                .required(true)
                .takes_value(true)
        )
        .arg(
            Arg::new("json-credentials")
                .long("json-credentials")
                .help("Path to a credentials file; defaults to application-default credentials")
                .takes_value(true)
                .allow_invalid_utf8(true)
        )
        .subcommand(Command::new("read")
            .about("Download an object to stdout")
            .arg(
                Arg::new("key")
                    .help("Object name to get")
                    .required(true)
                    .takes_value(true)
            )
            .arg(
                Arg::new("offset")
                    .long("offset")
                    .help("Do a partial read starting at this byte offset")
                    .takes_value(true)
            )
            .arg(
                Arg::new("length")
                    .long("length")
                    .help("Do a partial read with this size")
                    .takes_value(true)
            )
        )
        .subcommand(Command::new("write")
            .about("Upload an object")
            .arg(
                Arg::new("key")
                    .help("Object name to set")
                    .required(true)
                    .takes_value(true)
            )
            .arg(
                Arg::new("data-literal")
                    .long("data-literal")
                    .help("Data to set; use either this or --data-file")
                    .takes_value(true)
            )
            .arg(
                Arg::new("data-file")
                    .long("data-file")
                    .help("Read data to set from file; use either this or --data-literal")
                    .takes_value(true)
                    .allow_invalid_utf8(true)
            )
        )
        .subcommand(Command::new("delete")
            .about("Delete an object")
            .arg(
                Arg::new("key")
                    .help("Object name to delete")
                    .required(true)
                    .takes_value(true)
            )
        )
        .subcommand(Command::new("list")
            .about("List object names under a prefix")
            .arg(
                Arg::new("prefix")
                    .help("Object name prefix")
                    .required(true)
                    .takes_value(true)
            )
            .arg(
                Arg::new("start")
                    .long("start")
                    .help("First name to list (inclusive)")
                    .takes_value(true)
            )
            .arg(
                Arg::new("end")
                    .long("end")
                    .help("Name at which to stop listing (exclusive)")
                    .takes_value(true)
            )
        );

    let matches = match cli.try_get_matches_from_mut(env::args_os()) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    macro_rules! check {
        ($res:expr $(,)?) => {
            match $res {
                Ok(r) => r,
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            }
        };
        ($res:expr, $msg:expr $(,)?) => {
            match $res {
                Ok(r) => r,
                Err(e) => {
                    eprintln!("{}: {}", $msg, e);
                    std::process::exit(1);
                }
            }
        };
    }

    // Set up logging
    {
        let level = match matches.occurrences_of("verbose") {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        };
        let mut logger_builder = env_logger::builder();
        logger_builder.filter(None, level);
        if let Ok(val) = env::var("GCS_STORE_LOG") {
            logger_builder.parse_filters(&val);
        }
        if let Ok(val) = env::var("GCS_STORE_LOG_STYLE") {
            logger_builder.parse_write_style(&val);
        }
        logger_builder.init();
    }

    let bucket = matches.value_of("bucket").unwrap().to_owned();
    let credentials = match matches.value_of_os("json-credentials") {
        Some(path) => Credentials::JsonFile(PathBuf::from(path)),
        None => Credentials::Default,
    };
    let store = check!(
        GcsStore::connect(bucket, credentials),
        "Error connecting to the object store",
    );

    match matches.subcommand_name() {
        Some("read") => {
            let s_matches = matches.subcommand_matches("read").unwrap();
            let key = s_matches.value_of("key").unwrap();
            let offset: Option<u64> = match s_matches.value_of("offset") {
                None => None,
                Some(s) => match s.parse() {
                    Ok(i) => Some(i),
                    Err(_) => {
                        eprintln!("Invalid offset");
                        std::process::exit(2);
                    }
                },
            };
            let length: Option<usize> = match s_matches.value_of("length") {
                None => None,
                Some(s) => match s.parse() {
                    Ok(i) => Some(i),
                    Err(_) => {
                        eprintln!("Invalid length");
                        std::process::exit(2);
                    }
                },
            };

            let data = match (offset, length) {
                (None, None) => check!(store.read_object(key)),
                (offset, length) => check!(store.read_part(
                    key,
                    offset.unwrap_or(0),
                    length.unwrap_or(u32::MAX as usize),
                )),
            };
            match data {
                None => eprintln!("No such key"),
                Some(bytes) => check!(std::io::stdout().write_all(&bytes)),
            }
        }
        Some("write") => {
            let s_matches = matches.subcommand_matches("write").unwrap();
            let key = s_matches.value_of("key").unwrap();
            let data: Cow<[u8]> = {
                let data_literal = s_matches.value_of("data-literal");
                let data_file = s_matches.value_of_os("data-file");
                if data_literal.is_some() && data_file.is_some() {
                    eprintln!("Please provide EITHER --data-literal or --data-file");
                    std::process::exit(2);
                } else if let Some(d) = data_literal {
                    Cow::Borrowed(d.as_bytes())
                } else if let Some(path) = data_file {
                    fn read_file(path: &Path) -> Result<Vec<u8>, std::io::Error> {
                        use std::io::Read;
                        let mut file = std::fs::File::open(path)?;
                        let mut data = Vec::new();
                        file.read_to_end(&mut data)?;
                        Ok(data)
                    }

                    match read_file(Path::new(path)) {
                        Ok(d) => Cow::Owned(d),
                        Err(e) => {
                            eprintln!("Error reading data file: {}", e);
                            std::process::exit(1);
                        }
                    }
                } else {
                    eprintln!("Data missing, please provide --data-literal or --data-file");
                    std::process::exit(2);
                }
            };

            check!(store.write_object(key, &data));
        }
        Some("delete") => {
            let s_matches = matches.subcommand_matches("delete").unwrap();
            let key = s_matches.value_of("key").unwrap().to_owned();

            let mut failed = false;
            check!(store.delete_batch(&[key], &mut |key, err| {
                eprintln!("{}: {}", key, err);
                failed = true;
            }));
            if failed {
                std::process::exit(1);
            }
        }
        Some("list") => {
            let s_matches = matches.subcommand_matches("list").unwrap();
            let prefix = s_matches.value_of("prefix").unwrap();
            let start = s_matches.value_of("start");
            let end = s_matches.value_of("end");

            let keys = check!(store.list_keys(prefix, start, end));
            let stdout = std::io::stdout();
            let mut stdout = stdout.lock();
            for key in keys {
                check!(writeln!(stdout, "{}", key));
            }
        }
        _ => {
            cli.print_help().expect("Can't print help");
            std::process::exit(2);
        }
    }
}
