use clap::Parser;
use std::path::PathBuf;

/// cryocond: device server for Cryo-con temperature controllers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML config file path (default: $CRYOCOND_CONFIG, then
    /// ~/.config/cryocond/config.yml, then /etc/cryocond/config.yml)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Detach and run in the background
    #[arg(short = 'd', long = "daemonize", default_value = "false")]
    pub daemonize: bool,

    /// Log at debug level
    #[arg(short = 'v', long = "verbose", default_value = "false")]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let cli = Cli::parse_from(["cryocond", "-c", "/tmp/cryo.yml", "-d", "--verbose"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/cryo.yml")));
        assert!(cli.daemonize);
        assert!(cli.verbose);

        let cli = Cli::parse_from(["cryocond"]);
        assert!(cli.config.is_none());
        assert!(!cli.daemonize && !cli.verbose);
    }
}
