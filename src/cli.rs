use clap::Parser;
use std::path::PathBuf;

// Build version with target info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Drive the navigation runtime from the command line
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Locations to visit in order; the first one is the startup location (e.g. "#/products/shoes")
    #[arg(value_name = "LOCATION")]
    pub locations: Vec<String>,

    /// Start with a logged-in user holding this session token
    #[arg(short = 't', long = "token", value_name = "TOKEN")]
    pub token: Option<String>,

    /// Resolve assets against this directory; missing files count as failed loads
    #[arg(short = 'a', long = "assets-dir", value_name = "DIR")]
    pub assets_dir: Option<PathBuf>,

    /// Modules the view factory refuses to build (can be specified multiple times)
    #[arg(long = "broken", value_name = "MODULE")]
    pub broken: Vec<String>,

    /// Print the effective configuration as JSON and exit
    #[arg(long = "dump-config")]
    pub dump_config: bool,

    /// Enable debug logging to file (default: navrt.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_locations_and_flags() {
        let args = Args::parse_from(["navrt", "-vv", "--token", "abc", "#/home", "product/3", "--broken", "HomeView"]);
        assert_eq!(args.locations, vec!["#/home", "product/3"]);
        assert_eq!(args.token.as_deref(), Some("abc"));
        assert_eq!(args.verbosity, 2);
        assert_eq!(args.broken, vec!["HomeView"]);
        assert!(args.log_file.is_none());
    }

    #[test]
    fn test_log_flag_optional_value() {
        let args = Args::parse_from(["navrt", "--log"]);
        assert_eq!(args.log_file, Some(None));
        let args = Args::parse_from(["navrt", "--log", "out.log"]);
        assert_eq!(args.log_file, Some(Some(PathBuf::from("out.log"))));
    }
}
