//! Articles command: lists a Reading List collection.

use super::{format_timestamp, transport, CliResult};
use rlsync_engine::protocol::{fields, ServerReadingListRecord};
use rlsync_engine::reading_list::{DownloadOutcome, ReadingListClient};
use tracing::{info, warn};
use url::Url;

/// Lists articles changed after `since`, or all live articles.
pub fn run(endpoint: &Url, token: Option<&str>, since: Option<i64>, format: &str) -> CliResult<()> {
    let client = ReadingListClient::new(transport(token)?, endpoint)?;
    info!(url = %client.articles_url(), ?since, "listing articles");

    match client.get_since(since)? {
        DownloadOutcome::NotModified => {
            println!("Nothing changed since {}", since.map_or_else(String::new, format_timestamp));
        }
        DownloadOutcome::Records {
            records,
            last_modified,
            total_records,
        } => {
            if let Some(total) = total_records {
                if total != records.len() as i64 {
                    warn!(total, received = records.len(), "record count mismatch");
                }
            }
            for record in &records {
                print_article(record, format)?;
            }
            if format != "json" {
                println!();
                println!("{} articles", records.len());
                if let Some(last_modified) = last_modified {
                    println!("Last modified: {} ({})", last_modified, format_timestamp(last_modified));
                }
            }
        }
        DownloadOutcome::Failed(error) => return Err(error.into()),
    }
    Ok(())
}

fn print_article(record: &ServerReadingListRecord, format: &str) -> CliResult<()> {
    if format == "json" {
        println!("{}", serde_json::to_string(&record.to_json())?);
        return Ok(());
    }
    let guid = record.guid().unwrap_or("-");
    if record.deleted {
        println!("{}  (deleted)", guid);
        return Ok(());
    }
    let unread = if record.fields.get_bool(fields::UNREAD).unwrap_or(true) {
        "unread"
    } else {
        "read"
    };
    println!(
        "{}  {:<6}  {}  {}",
        guid,
        unread,
        record.fields.get_str(fields::URL).unwrap_or("-"),
        record.fields.get_str(fields::TITLE).unwrap_or("")
    );
    Ok(())
}
