use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Stay on the local definitions file even when a remote store is configured
    #[clap(long, global = true, default_value = "false")]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Add a semantic type
    Add {
        /// Read the definition from a JSON file
        #[clap(short, long, conflicts_with_all = ["name", "values", "pattern"])]
        file: Option<PathBuf>,

        /// Type name (e.g. EMPLOYEE_ID)
        #[clap(short, long, required_unless_present = "file")]
        name: Option<String>,

        /// Human readable description
        #[clap(short, long, default_value = "")]
        description: String,

        /// Comma separated list of accepted values
        #[clap(short, long, conflicts_with = "pattern")]
        values: Option<String>,

        /// Regular expression matching accepted values
        #[clap(short, long)]
        pattern: Option<String>,

        #[clap(long)]
        priority: Option<u32>,
    },

    /// Replace a semantic type with the definition in a JSON file
    Update {
        /// Current name of the type
        name: String,

        /// JSON definition; its name may differ to rename the type
        #[clap(short, long)]
        file: PathBuf,
    },

    /// Remove a semantic type
    Remove { name: String },

    /// Print one semantic type
    Show { name: String },

    /// List semantic types
    List {
        /// Only user defined types
        #[clap(long, default_value = "false")]
        custom: bool,

        /// Print names only
        #[clap(short, long, default_value = "false")]
        short: bool,
    },

    /// Find types similar to a description or to an existing type
    Similar {
        #[clap(required_unless_present = "like")]
        description: Option<String>,

        /// Use an existing type as the query and leave it out of the results
        #[clap(long, conflicts_with_all = ["description", "examples", "headers", "best"])]
        like: Option<String>,

        /// Comma separated example values
        #[clap(short, long)]
        examples: Option<String>,

        /// Comma separated column headers
        #[clap(long)]
        headers: Option<String>,

        /// Minimum similarity [0.0, 1.0]
        #[clap(short, long)]
        threshold: Option<f32>,

        /// Return the few closest types for disambiguation
        #[clap(long, default_value = "false", conflicts_with = "best")]
        disambiguate: bool,

        /// Return only the single best match above the default threshold
        #[clap(long, default_value = "false")]
        best: bool,
    },

    /// Rebuild the vector index
    Reindex {
        /// Clear the index and re-embed every type
        #[clap(long, default_value = "false")]
        full: bool,
    },

    /// Re-read definitions from the active store
    Sync {},

    /// Return to the local definitions file and clear the definitions cached there
    Disconnect {},

    /// Show storage mode and index state
    Status {},
}

/// Splits comma separated input, dropping blanks.
pub fn split_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_list_trims_and_drops_blanks() {
        assert_eq!(split_list(" a, b ,,c ,"), vec!["a", "b", "c"]);
        assert!(split_list(" , ").is_empty());
    }

    #[test]
    fn add_requires_name_or_file() {
        assert!(Args::try_parse_from(["semtypes", "add"]).is_err());
        assert!(Args::try_parse_from(["semtypes", "add", "--name", "X", "--values", "a,b"]).is_ok());
        assert!(Args::try_parse_from(["semtypes", "add", "--file", "x.json"]).is_ok());
        assert!(
            Args::try_parse_from(["semtypes", "add", "--file", "x.json", "--name", "X"]).is_err()
        );
    }

    #[test]
    fn similar_flags_conflict() {
        let parsed = Args::try_parse_from(["semtypes", "similar", "staff id", "--disambiguate", "--best"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn similar_takes_description_or_existing_type() {
        assert!(Args::try_parse_from(["semtypes", "similar"]).is_err());
        assert!(Args::try_parse_from(["semtypes", "similar", "--like", "EMPLOYEE_ID"]).is_ok());
        assert!(
            Args::try_parse_from(["semtypes", "similar", "staff id", "--like", "EMPLOYEE_ID"]).is_err()
        );
        assert!(
            Args::try_parse_from(["semtypes", "similar", "--like", "EMPLOYEE_ID", "--best"]).is_err()
        );

        let parsed = Args::try_parse_from(["semtypes", "similar", "--like", "CITY", "--disambiguate"]);
        match parsed.unwrap().command {
            Command::Similar {
                description,
                like,
                disambiguate,
                ..
            } => {
                assert_eq!(description, None);
                assert_eq!(like.as_deref(), Some("CITY"));
                assert!(disambiguate);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn sync_and_disconnect_take_no_arguments() {
        assert!(matches!(
            Args::try_parse_from(["semtypes", "sync"]).unwrap().command,
            Command::Sync {}
        ));
        assert!(matches!(
            Args::try_parse_from(["semtypes", "disconnect"]).unwrap().command,
            Command::Disconnect {}
        ));
        assert!(Args::try_parse_from(["semtypes", "disconnect", "now"]).is_err());
    }
}
