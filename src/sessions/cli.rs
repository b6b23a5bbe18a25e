//! `versa sessions ...` command handlers.
//!
//! The fast tier lives inside the serving process, so these commands read and
//! write the durable tier only.

use anyhow::Result;

use crate::config::Config;
use crate::storage::{create_durable_store, DurableStore};
use crate::SessionCommands;

fn preview(content: &str) -> String {
    let line = content.lines().next().unwrap_or(content);
    if line.chars().count() <= 80 {
        line.to_string()
    } else {
        let truncated: String = line.chars().take(77).collect();
        format!("{truncated}...")
    }
}

pub async fn handle_session_command(command: SessionCommands, config: &Config) -> Result<()> {
    let store = create_durable_store(config).await?;
    run(command, store.as_ref()).await
}

async fn run(command: SessionCommands, store: &dyn DurableStore) -> Result<()> {
    match command {
        SessionCommands::Show { id, limit } => {
            let Some(record) = store.get(&id).await? else {
                println!("No session found with id: {id}");
                return Ok(());
            };
            println!("Session:  {id}");
            println!("Title:    {}", record.title.as_deref().unwrap_or("(none)"));
            println!("User:     {}", record.user_id);
            println!("PDF:      {}", record.latest_pdf_id);
            println!("Created:  {}", record.created_at.to_rfc3339());
            println!("Updated:  {}", record.updated_at.to_rfc3339());
            println!("Messages: {}\n", record.chat_history.len());

            let skip = record.chat_history.len().saturating_sub(limit);
            for message in record.chat_history.iter().skip(skip) {
                println!("[{}] {:>5}: {}", message.timestamp, message.role.as_str(), preview(&message.content));
            }
        }
        SessionCommands::List {
            user,
            limit,
            offset,
        } => {
            let sessions = store.list_for_user(&user).await?;
            if sessions.is_empty() {
                println!("No sessions found for user {user}.");
                return Ok(());
            }
            let total = sessions.len();
            let page: Vec<_> = sessions.into_iter().skip(offset).take(limit).collect();
            if page.is_empty() {
                println!("No sessions at offset {offset} (total: {total}).");
                return Ok(());
            }
            println!(
                "Sessions for {user} ({total} total, showing {}-{}):\n",
                offset + 1,
                offset + page.len(),
            );
            for summary in &page {
                println!(
                    "- {} [{} messages, updated {}]",
                    summary.chat_session_id,
                    summary.message_count,
                    summary.updated_at.to_rfc3339()
                );
                println!("    {}", summary.title.as_deref().unwrap_or("(untitled)"));
            }
            if offset + page.len() < total {
                println!("\n  Use --offset {} to see the next page.", offset + limit);
            }
        }
        SessionCommands::Clear { id, yes } => {
            if store.get(&id).await?.is_none() {
                println!("No session found with id: {id}");
                return Ok(());
            }
            if !yes {
                eprintln!("Use --yes to confirm deletion of session '{id}'.");
                return Ok(());
            }
            store.delete(&id).await?;
            println!("✓ Deleted session: {id}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::{Message, Role};
    use crate::storage::{DurableRecord, InMemoryDurableStore};
    use chrono::Utc;

    fn record() -> DurableRecord {
        DurableRecord {
            user_id: "u1".into(),
            latest_pdf_id: "p1".into(),
            title: Some("Budget".into()),
            chat_history: vec![Message {
                role: Role::Human,
                content: "hello".into(),
                timestamp: 1,
                pdf_id: "p1".into(),
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn preview_truncates_long_first_line() {
        assert_eq!(preview("short\nsecond"), "short");
        let long = "x".repeat(100);
        let shown = preview(&long);
        assert_eq!(shown.chars().count(), 80);
        assert!(shown.ends_with("..."));
    }

    #[tokio::test]
    async fn clear_requires_confirmation() {
        let store = InMemoryDurableStore::new();
        store.put("s1", &record()).await.unwrap();

        run(
            SessionCommands::Clear {
                id: "s1".into(),
                yes: false,
            },
            &store,
        )
        .await
        .unwrap();
        assert!(store.get("s1").await.unwrap().is_some());

        run(
            SessionCommands::Clear {
                id: "s1".into(),
                yes: true,
            },
            &store,
        )
        .await
        .unwrap();
        assert!(store.get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn show_and_list_tolerate_missing_sessions() {
        let store = InMemoryDurableStore::new();
        run(
            SessionCommands::Show {
                id: "nope".into(),
                limit: 5,
            },
            &store,
        )
        .await
        .unwrap();
        run(
            SessionCommands::List {
                user: "nobody".into(),
                limit: 10,
                offset: 0,
            },
            &store,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn handler_opens_configured_store() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.config_path = tmp.path().join("config.toml");
        handle_session_command(
            SessionCommands::List {
                user: "u1".into(),
                limit: 10,
                offset: 0,
            },
            &config,
        )
        .await
        .unwrap();
        assert!(tmp.path().join("sessions.db").exists());
    }
}
