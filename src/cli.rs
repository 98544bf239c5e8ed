use clap::{ArgAction, Parser};

use crate::session::SourceId;

pub const DEFAULT_TITLE: &str = "wlr dmabuf output mirror";

#[derive(Parser, Debug)]
#[command(name = "wdomirror")]
#[command(about = "Mirror a wlroots output into a window over dmabuf")]
#[command(version)]
#[command(disable_help_flag = true)]
pub struct Cli {
    /// Registry ID of the output to mirror; omit to list outputs
    pub source_id: Option<u32>,

    /// List mirrorable outputs
    #[arg(short = 'h', long)]
    pub list: bool,

    /// Print the output list as JSON
    #[arg(long)]
    pub json: bool,

    /// Don't overlay the cursor on captured frames
    #[arg(long)]
    pub no_cursor: bool,

    /// Window title
    #[arg(long, default_value = DEFAULT_TITLE)]
    pub title: String,

    /// Hide the status spinner
    #[arg(short, long)]
    pub quiet: bool,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    pub help: Option<bool>,
}

/// What to mirror and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorConfig {
    pub source: SourceId,
    pub include_cursor: bool,
    pub title: String,
    pub show_progress: bool,
}

impl Cli {
    /// `None` when the invocation asks for the output list instead.
    pub fn mirror_config(&self) -> Option<MirrorConfig> {
        if self.list {
            return None;
        }
        let source = self.source_id?;
        Some(MirrorConfig {
            source: SourceId(source),
            include_cursor: !self.no_cursor,
            title: self.title.clone(),
            show_progress: !self.quiet,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("wdomirror").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_no_arguments_lists() {
        assert_eq!(parse(&[]).mirror_config(), None);
    }

    #[test]
    fn test_short_h_lists() {
        let cli = parse(&["-h"]);
        assert!(cli.list);
        assert_eq!(cli.mirror_config(), None);
    }

    #[test]
    fn test_list_wins_over_source() {
        assert_eq!(parse(&["--list", "48"]).mirror_config(), None);
    }

    #[test]
    fn test_source_id_defaults() {
        let config = parse(&["48"]).mirror_config().unwrap();
        assert_eq!(
            config,
            MirrorConfig {
                source: SourceId(48),
                include_cursor: true,
                title: DEFAULT_TITLE.to_string(),
                show_progress: true,
            }
        );
    }

    #[test]
    fn test_options() {
        let config = parse(&["--no-cursor", "--title", "left", "-q", "7"])
            .mirror_config()
            .unwrap();
        assert_eq!(config.source, SourceId(7));
        assert!(!config.include_cursor);
        assert_eq!(config.title, "left");
        assert!(!config.show_progress);
    }

    #[test]
    fn test_invalid_source_id() {
        assert!(Cli::try_parse_from(["wdomirror", "DP-1"]).is_err());
    }

    #[test]
    fn test_long_help() {
        let err = Cli::try_parse_from(["wdomirror", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
