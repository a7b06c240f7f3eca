//! CLI argument parsing for the catalog daemon.
//!
//! CLI flags override all other config sources.

use clap::{Parser, Subcommand};

use catalog_types::{RelatedEntity, Uid};

/// Catalog Search Daemon
///
/// Builds and maintains the catalog search indexes from pending index
/// notifications.
#[derive(Parser, Debug)]
#[command(name = "catalog-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default ~/.config/catalog-search/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Daemon commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build indexes from pending notifications (every index type by default)
    Build {
        /// Only build this index (e.g. product, sku, cmuser)
        #[arg(short, long)]
        index_type: Option<String>,
    },

    /// Force a full rebuild of one index
    Rebuild {
        /// Index name
        index: String,
    },

    /// Optimize every index not excluded by configuration
    Optimize,

    /// Record an index notification
    Notify {
        /// Index name
        index: String,

        /// update, delete, delete_all or rebuild
        update_type: String,

        /// Affected uid (repeatable)
        #[arg(long = "uid")]
        uids: Vec<Uid>,

        /// Related entity as TYPE:UID, e.g. category:40
        #[arg(long, value_parser = parse_related, conflicts_with = "uids")]
        related: Option<RelatedEntity>,
    },

    /// Store an entity record
    PutEntity {
        /// Index name
        index: String,

        /// Entity uid
        uid: Uid,

        /// Fields as KEY=VALUE
        #[arg(value_parser = parse_key_value)]
        fields: Vec<(String, String)>,

        /// Relation as TYPE:UID (repeatable)
        #[arg(long = "relation", value_parser = parse_related)]
        relations: Vec<RelatedEntity>,
    },

    /// Show pending notifications and index statistics
    Status,

    /// Run scheduled build and optimize jobs until interrupted
    Run,
}

/// Parse `KEY=VALUE`.
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

/// Parse `TYPE:UID`.
pub fn parse_related(s: &str) -> Result<RelatedEntity, String> {
    let (entity_type, uid) = s
        .split_once(':')
        .ok_or_else(|| format!("expected TYPE:UID, got '{}'", s))?;
    if entity_type.trim().is_empty() {
        return Err(format!("empty entity type in '{}'", s));
    }
    let uid = uid
        .trim()
        .parse::<Uid>()
        .map_err(|e| format!("invalid uid in '{}': {}", s, e))?;
    Ok(RelatedEntity::new(entity_type.trim(), uid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_build_all() {
        let cli = Cli::parse_from(["catalog-daemon", "build"]);
        match cli.command {
            Commands::Build { index_type } => assert!(index_type.is_none()),
            _ => panic!("Expected Build command"),
        }
    }

    #[test]
    fn test_cli_build_one_with_globals() {
        let cli = Cli::parse_from([
            "catalog-daemon",
            "--config",
            "/tmp/catalog.toml",
            "build",
            "--index-type",
            "sku",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.config.as_deref(), Some("/tmp/catalog.toml"));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Commands::Build { index_type } => assert_eq!(index_type.as_deref(), Some("sku")),
            _ => panic!("Expected Build command"),
        }
    }

    #[test]
    fn test_cli_rebuild() {
        let cli = Cli::parse_from(["catalog-daemon", "rebuild", "product"]);
        match cli.command {
            Commands::Rebuild { index } => assert_eq!(index, "product"),
            _ => panic!("Expected Rebuild command"),
        }
    }

    #[test]
    fn test_cli_notify_uids() {
        let cli = Cli::parse_from([
            "catalog-daemon",
            "notify",
            "product",
            "update",
            "--uid",
            "7",
            "--uid",
            "8",
        ]);
        match cli.command {
            Commands::Notify {
                index,
                update_type,
                uids,
                related,
            } => {
                assert_eq!(index, "product");
                assert_eq!(update_type, "update");
                assert_eq!(uids, vec![7, 8]);
                assert!(related.is_none());
            }
            _ => panic!("Expected Notify command"),
        }
    }

    #[test]
    fn test_cli_notify_related() {
        let cli = Cli::parse_from([
            "catalog-daemon",
            "notify",
            "product",
            "update",
            "--related",
            "category:40",
        ]);
        match cli.command {
            Commands::Notify { related, .. } => {
                assert_eq!(related, Some(RelatedEntity::new("category", 40)))
            }
            _ => panic!("Expected Notify command"),
        }
    }

    #[test]
    fn test_cli_notify_uid_and_related_conflict() {
        let result = Cli::try_parse_from([
            "catalog-daemon",
            "notify",
            "product",
            "update",
            "--uid",
            "1",
            "--related",
            "brand:5",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_put_entity() {
        let cli = Cli::parse_from([
            "catalog-daemon",
            "put-entity",
            "product",
            "12",
            "name=Red Shoe",
            "color=red",
            "--relation",
            "brand:5",
        ]);
        match cli.command {
            Commands::PutEntity {
                index,
                uid,
                fields,
                relations,
            } => {
                assert_eq!(index, "product");
                assert_eq!(uid, 12);
                assert_eq!(
                    fields,
                    vec![
                        ("name".to_string(), "Red Shoe".to_string()),
                        ("color".to_string(), "red".to_string())
                    ]
                );
                assert_eq!(relations, vec![RelatedEntity::new("brand", 5)]);
            }
            _ => panic!("Expected PutEntity command"),
        }
    }

    #[test]
    fn test_cli_status_and_run() {
        assert!(matches!(
            Cli::parse_from(["catalog-daemon", "status"]).command,
            Commands::Status
        ));
        assert!(matches!(
            Cli::parse_from(["catalog-daemon", "run"]).command,
            Commands::Run
        ));
        assert!(matches!(
            Cli::parse_from(["catalog-daemon", "optimize"]).command,
            Commands::Optimize
        ));
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("a=b=c").unwrap(),
            ("a".to_string(), "b=c".to_string())
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn test_parse_related() {
        assert_eq!(
            parse_related("store:3").unwrap(),
            RelatedEntity::new("store", 3)
        );
        assert!(parse_related("store").is_err());
        assert!(parse_related("store:x").is_err());
        assert!(parse_related(":3").is_err());
    }
}
