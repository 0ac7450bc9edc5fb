use clap::{Parser, Subcommand};
use std::path::PathBuf;
use track_edit_lib::{Config, SimplifyConfig};

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
/// Track Edit - import GPX files, inspect their statistics and reduce routes
pub struct Settings {
    /// History store file; without it the session lives in memory only
    #[clap(short, long, value_name = "FILE", global = true)]
    pub store: Option<PathBuf>,

    /// Maximum number of undoable edits kept in the history
    #[clap(long, default_value = "100", global = true)]
    pub history_capacity: usize,

    /// Tolerance of the first simplification pass, in meters
    #[clap(long, default_value = "1000.0", global = true)]
    pub initial_tolerance: f64,

    /// Smallest simplification tolerance, in meters
    #[clap(long, default_value = "50.0", global = true)]
    pub min_tolerance: f64,

    /// Speed (m/s) above which time counts as moving
    #[clap(long, default_value = "0.5", global = true)]
    pub moving_speed_threshold: f64,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Import GPX files and print statistics per document and in total
    Stats {
        /// GPX files to import
        #[clap(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
    },
    /// Import a GPX file and reduce every segment to the points retained at a tolerance
    Reduce {
        /// GPX file to import
        #[clap(value_name = "FILE")]
        file: PathBuf,

        /// Points whose retained distance is below this many meters are dropped
        #[clap(short, long, default_value = "100.0")]
        tolerance: f64,
    },
    /// Print the documents and history position of a persisted session
    Show,
    /// Undo the last edit of a persisted session
    Undo,
    /// Redo the next edit of a persisted session
    Redo,
}

impl Settings {
    pub fn config(&self) -> Config {
        Config {
            history_capacity: self.history_capacity,
            simplification: SimplifyConfig {
                initial_tolerance: self.initial_tolerance,
                min_tolerance: self.min_tolerance,
            },
            moving_speed_threshold: self.moving_speed_threshold,
            background_rebuild: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_library_config() {
        let settings = Settings::parse_from(["track-edit", "stats", "a.gpx"]);
        assert_eq!(settings.config(), Config::default());
        assert!(settings.store.is_none());
    }

    #[test]
    fn test_reduce_arguments() {
        let settings = Settings::parse_from([
            "track-edit",
            "reduce",
            "ride.gpx",
            "--tolerance",
            "250",
            "--store",
            "/tmp/h.json",
        ]);
        match settings.command {
            Command::Reduce { file, tolerance } => {
                assert_eq!(file, PathBuf::from("ride.gpx"));
                assert_eq!(tolerance, 250.0);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(settings.store, Some(PathBuf::from("/tmp/h.json")));
    }
}
