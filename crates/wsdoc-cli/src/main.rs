//! wsdoc CLI
//!
//! Inspect and maintain a SQLite-backed wsdoc document store.
//!
//! # Usage
//!
//! ```bash
//! # Append two update files to a document
//! wsdoc push my-workspace my-doc update-1.bin update-2.bin
//!
//! # Compact and export the merged document
//! wsdoc get my-workspace my-doc --out doc.bin
//!
//! # Browse and restore history
//! wsdoc history my-workspace my-doc --limit 10
//! wsdoc rollback my-workspace my-doc 3
//!
//! # With configuration file
//! wsdoc --config /etc/wsdoc/wsdoc.toml versions my-workspace
//! ```

mod config;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use serde_json::json;
use tracing::debug;
use tracing_subscriber::FmtSubscriber;

use config::Config;
use wsdoc_core::{DocUpdate, HistoryQuery};
use wsdoc_storage::{DocEngine, DocStorage, DocStorageOptions, SqliteStorage};

/// wsdoc - workspace document store
#[derive(Parser, Debug)]
#[command(name = "wsdoc")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "WSDOC_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path (overrides the config file)
    #[arg(long, env = "WSDOC_DB")]
    db: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "WSDOC_LOG_LEVEL")]
    log_level: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Append update files to a document's pending log
    Push {
        workspace: String,
        doc: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Merge pending updates and show the current document
    Get {
        workspace: String,
        doc: String,
        /// Write the merged payload to this file
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// List the latest version of every document in a workspace
    Versions { workspace: String },
    /// List historical snapshots of a document, newest first
    History {
        workspace: String,
        doc: String,
        #[arg(long, default_value_t = 0)]
        skip: usize,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Restore a document to a historical snapshot
    Rollback {
        workspace: String,
        doc: String,
        version: u64,
    },
    /// Delete a document with its updates and history
    DeleteDoc { workspace: String, doc: String },
    /// Delete every document of a workspace
    DeleteWorkspace { workspace: String },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run_cli(args).await {
        eprintln!("{} {:#}", "Error:".red(), e);
        std::process::exit(1);
    }
}

async fn run_cli(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.apply_overrides(args.db, args.log_level);

    FmtSubscriber::builder()
        .with_max_level(config.log_level())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let db_path = &config.storage.path;
    debug!(path = %db_path.display(), "Opening document store");
    let storage = SqliteStorage::new(db_path)
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    let engine = DocEngine::new(Arc::new(storage), DocStorageOptions::default());

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run(&engine, args.command, args.json, &mut out).await
}

async fn run<S, W>(engine: &DocEngine<S>, command: Command, json: bool, out: &mut W) -> Result<()>
where
    S: DocStorage + ?Sized,
    W: Write,
{
    match command {
        Command::Push {
            workspace,
            doc,
            files,
        } => {
            let mut updates = Vec::with_capacity(files.len());
            for file in &files {
                let bin = std::fs::read(file)
                    .with_context(|| format!("Failed to read update file {}", file.display()))?;
                updates.push(DocUpdate::new(bin));
            }

            let count = updates.len();
            let version = engine.push_doc_updates(&workspace, &doc, updates).await?;

            if json {
                writeln!(out, "{}", json!({ "pushed": count, "version": version }))?;
            } else {
                writeln!(out, "Pushed {} update(s) to {}/{}, latest version {}", count, workspace, doc, version)?;
            }
        }

        Command::Get {
            workspace,
            doc,
            out: path,
        } => {
            let Some(record) = engine.get_doc(&workspace, &doc).await? else {
                bail!("Document {}/{} not found", workspace, doc);
            };

            if let Some(path) = &path {
                std::fs::write(path, &record.bin)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            }

            if json {
                writeln!(
                    out,
                    "{}",
                    json!({
                        "workspace_id": record.workspace_id,
                        "doc_id": record.doc_id,
                        "version": record.version,
                        "size": record.bin.len(),
                    })
                )?;
            } else {
                writeln!(
                    out,
                    "{}/{} version {}, {} bytes",
                    record.workspace_id,
                    record.doc_id,
                    record.version,
                    record.bin.len()
                )?;
                if let Some(path) = &path {
                    writeln!(out, "Wrote payload to {}", path.display())?;
                }
            }
        }

        Command::Versions { workspace } => {
            let Some(versions) = engine.get_doc_versions(&workspace).await? else {
                bail!("Workspace {} not found", workspace);
            };

            let mut versions: Vec<(String, u64)> = versions.into_iter().collect();
            versions.sort();

            if json {
                let map: serde_json::Map<String, serde_json::Value> = versions
                    .into_iter()
                    .map(|(doc, version)| (doc, json!(version)))
                    .collect();
                writeln!(out, "{}", serde_json::Value::Object(map))?;
            } else {
                for (doc, version) in versions {
                    writeln!(out, "{}\t{}", doc, version)?;
                }
            }
        }

        Command::History {
            workspace,
            doc,
            skip,
            limit,
        } => {
            let mut query = HistoryQuery::new().with_skip(skip);
            if let Some(limit) = limit {
                query = query.with_limit(limit);
            }

            let histories = engine.list_doc_histories(&workspace, &doc, query).await?;

            if json {
                let entries: Vec<_> = histories
                    .iter()
                    .map(|h| json!({ "version": h.version, "size": h.bin.len() }))
                    .collect();
                writeln!(out, "{}", serde_json::Value::Array(entries))?;
            } else {
                for history in &histories {
                    writeln!(out, "{}\t{} bytes", history.version, history.bin.len())?;
                }
            }
        }

        Command::Rollback {
            workspace,
            doc,
            version,
        } => {
            let new_version = engine.rollback_doc(&workspace, &doc, version).await?;

            if json {
                writeln!(out, "{}", json!({ "restored": version, "version": new_version }))?;
            } else {
                writeln!(
                    out,
                    "Rolled back {}/{} to version {}, now at version {}",
                    workspace, doc, version, new_version
                )?;
            }
        }

        Command::DeleteDoc { workspace, doc } => {
            let deleted = engine.delete_doc(&workspace, &doc).await?;

            if json {
                writeln!(out, "{}", json!({ "deleted": deleted }))?;
            } else if deleted {
                writeln!(out, "Deleted {}/{}", workspace, doc)?;
            } else {
                writeln!(out, "Document {}/{} not found", workspace, doc)?;
            }
        }

        Command::DeleteWorkspace { workspace } => {
            engine.delete_workspace(&workspace).await?;

            if json {
                writeln!(out, "{}", json!({ "deleted": true }))?;
            } else {
                writeln!(out, "Deleted workspace {}", workspace)?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> DocEngine<SqliteStorage> {
        let concat = |updates: &[&[u8]]| -> wsdoc_core::Result<Vec<u8>> { Ok(updates.concat()) };
        DocEngine::new(
            Arc::new(SqliteStorage::in_memory().unwrap()),
            DocStorageOptions::with_merge_updates(concat),
        )
    }

    async fn exec(engine: &DocEngine<SqliteStorage>, json: bool, args: &[&str]) -> Result<String> {
        let mut argv = vec!["wsdoc"];
        argv.extend_from_slice(args);
        let parsed = Args::try_parse_from(argv)?;

        let mut out = Vec::new();
        run(engine, parsed.command, json || parsed.json, &mut out).await?;
        Ok(String::from_utf8(out)?)
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["wsdoc", "--db", "x.db", "history", "ws", "doc", "--limit", "5", "--json"])
            .unwrap();
        assert_eq!(args.db, Some(PathBuf::from("x.db")));
        assert!(args.json);
        assert!(matches!(args.command, Command::History { skip: 0, limit: Some(5), .. }));

        assert!(Args::try_parse_from(["wsdoc", "push", "ws", "doc"]).is_err());
    }

    #[tokio::test]
    async fn test_push_get_and_history() {
        let engine = engine();
        let dir = tempfile::tempdir().unwrap();

        let first = dir.path().join("1.bin");
        let second = dir.path().join("2.bin");
        std::fs::write(&first, b"hello ").unwrap();
        std::fs::write(&second, b"world").unwrap();

        let output = exec(
            &engine,
            false,
            &["push", "ws", "doc", first.to_str().unwrap(), second.to_str().unwrap()],
        )
        .await
        .unwrap();
        assert_eq!(output, "Pushed 2 update(s) to ws/doc, latest version 2\n");

        let exported = dir.path().join("doc.bin");
        let output = exec(&engine, true, &["get", "ws", "doc", "--out", exported.to_str().unwrap()])
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(value["version"], 2);
        assert_eq!(value["size"], 11);
        assert_eq!(std::fs::read(&exported).unwrap(), b"hello world");

        std::fs::write(&first, b"!").unwrap();
        exec(&engine, false, &["push", "ws", "doc", first.to_str().unwrap()]).await.unwrap();
        exec(&engine, false, &["get", "ws", "doc"]).await.unwrap();

        let output = exec(&engine, false, &["history", "ws", "doc"]).await.unwrap();
        assert_eq!(output, "2\t11 bytes\n");

        let output = exec(&engine, false, &["versions", "ws"]).await.unwrap();
        assert_eq!(output, "doc\t3\n");
    }

    #[tokio::test]
    async fn test_rollback_and_delete() {
        let engine = engine();
        engine.push_doc_updates("ws", "doc", vec![DocUpdate::new(*b"a")]).await.unwrap();
        engine.get_doc("ws", "doc").await.unwrap();
        engine.push_doc_updates("ws", "doc", vec![DocUpdate::new(*b"b")]).await.unwrap();
        engine.get_doc("ws", "doc").await.unwrap();

        let output = exec(&engine, true, &["rollback", "ws", "doc", "1"]).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(value["restored"], 1);
        assert_eq!(value["version"], 3);

        let err = exec(&engine, false, &["rollback", "ws", "doc", "99"]).await.unwrap_err();
        assert!(err.to_string().contains("Not found"));

        let output = exec(&engine, false, &["delete-doc", "ws", "doc"]).await.unwrap();
        assert_eq!(output, "Deleted ws/doc\n");
        let output = exec(&engine, false, &["delete-doc", "ws", "doc"]).await.unwrap();
        assert_eq!(output, "Document ws/doc not found\n");

        assert!(exec(&engine, false, &["get", "ws", "doc"]).await.is_err());
        assert!(exec(&engine, false, &["versions", "ws"]).await.is_err());
    }
}
