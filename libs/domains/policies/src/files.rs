//! Pipe-delimited transfer file for the booking system.
//!
//! One file per correlation id, so a redelivered message rewrites the same file.
//! Writes go to a temporary file first and are renamed into place.

use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use crate::error::PolicyResult;
use crate::models::ProcessPolicyCommand;

pub struct TransferFileWriter {
    output_dir: PathBuf,
}

impl TransferFileWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// `POLICY_<correlation_id>.txt`. Bytes outside `[A-Za-z0-9_-]` are
    /// percent-encoded, so distinct ids never share a file.
    pub fn file_name(correlation_id: &str) -> String {
        let mut name = String::from("POLICY_");
        for byte in correlation_id.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                name.push(char::from(byte));
            } else {
                let _ = write!(name, "%{:02X}", byte);
            }
        }
        name.push_str(".txt");
        name
    }

    pub fn render(command: &ProcessPolicyCommand, correlation_id: &str, now: DateTime<Utc>) -> String {
        let lines = [
            format!("POLICY_SUBMISSION|V1.0|{}", now.format("%Y-%m-%d %H:%M:%S")),
            String::new(),
            format!("POLICY_NUMBER|{}", field(&command.policy_number)),
            format!("CUSTOMER_NAME|{}", field(&command.customer_name)),
            format!("CUSTOMER_EMAIL|{}", field(&command.customer_email)),
            format!("CUSTOMER_AGE|{}", command.customer_age),
            format!("PREMIUM|{:.2}", command.premium),
            format!("SUBMITTED_DATE|{}", now.format("%Y-%m-%d")),
            format!("SUBMITTED_TIME|{}", now.format("%H:%M:%S")),
            format!("CORRELATION_ID|{}", field(correlation_id)),
            "SOURCE_SYSTEM|PolicyService".to_string(),
            String::new(),
            "END_OF_FILE".to_string(),
        ];

        let mut content = lines.join("\n");
        content.push('\n');
        content
    }

    /// Write the transfer file and return its path
    pub async fn write(
        &self,
        command: &ProcessPolicyCommand,
        correlation_id: &str,
    ) -> PolicyResult<PathBuf> {
        fs::create_dir_all(&self.output_dir).await?;

        let path = self.output_dir.join(Self::file_name(correlation_id));
        let temp_path = self.output_dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let content = Self::render(command, correlation_id, Utc::now());

        if let Err(e) = fs::write(&temp_path, content).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        info!(
            path = %path.display(),
            policy_number = %command.policy_number,
            "Generated transfer file"
        );
        Ok(path)
    }
}

/// Keep delimiters and line breaks out of field values
fn field(value: &str) -> String {
    value.replace(['|', '\n', '\r'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn command() -> ProcessPolicyCommand {
        ProcessPolicyCommand {
            policy_id: Uuid::now_v7(),
            policy_number: "POL-2024-0001".into(),
            customer_name: "Jane Doe".into(),
            customer_email: "jane@example.com".into(),
            customer_age: 42,
            policy_type: "Health".into(),
            premium: 1250.5,
            correlation_id: String::new(),
            retry_count: 0,
        }
    }

    #[test]
    fn test_render_layout() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 5).unwrap();
        let content = TransferFileWriter::render(&command(), "corr-1", now);
        let lines: Vec<&str> = content.lines().collect();

        assert_eq!(lines[0], "POLICY_SUBMISSION|V1.0|2024-03-01 09:30:05");
        assert_eq!(lines[1], "");
        assert_eq!(lines[2], "POLICY_NUMBER|POL-2024-0001");
        assert_eq!(lines[5], "CUSTOMER_AGE|42");
        assert_eq!(lines[6], "PREMIUM|1250.50");
        assert_eq!(lines[7], "SUBMITTED_DATE|2024-03-01");
        assert_eq!(lines[8], "SUBMITTED_TIME|09:30:05");
        assert_eq!(lines[9], "CORRELATION_ID|corr-1");
        assert_eq!(lines[10], "SOURCE_SYSTEM|PolicyService");
        assert_eq!(lines.last(), Some(&"END_OF_FILE"));
    }

    #[test]
    fn test_field_values_cannot_break_layout() {
        let mut cmd = command();
        cmd.customer_name = "Jane|Doe\nEVIL|1".into();
        let content = TransferFileWriter::render(&cmd, "corr-1", Utc::now());
        assert!(content.contains("CUSTOMER_NAME|Jane Doe EVIL 1\n"));
    }

    #[test]
    fn test_file_name_is_path_safe() {
        assert_eq!(TransferFileWriter::file_name("abc-123"), "POLICY_abc-123.txt");
        assert_eq!(TransferFileWriter::file_name("corr_1"), "POLICY_corr_1.txt");
        assert_eq!(
            TransferFileWriter::file_name("../etc/x"),
            "POLICY_%2E%2E%2Fetc%2Fx.txt"
        );
    }

    #[test]
    fn test_distinct_ids_get_distinct_files() {
        let ids = ["a.b", "a_b", "a/b", "a%2Eb", "a%2eb", "é", "%C3%A9"];
        let names: std::collections::HashSet<String> =
            ids.iter().map(|id| TransferFileWriter::file_name(id)).collect();
        assert_eq!(names.len(), ids.len());
    }

    #[tokio::test]
    async fn test_ids_differing_only_in_unsafe_chars_do_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TransferFileWriter::new(dir.path());

        let dotted = writer.write(&command(), "order.7").await.unwrap();
        let underscored = writer.write(&command(), "order_7").await.unwrap();

        assert_ne!(dotted, underscored);
        assert!(std::fs::read_to_string(&dotted).unwrap().contains("CORRELATION_ID|order.7"));
        assert!(std::fs::read_to_string(&underscored).unwrap().contains("CORRELATION_ID|order_7"));
    }

    #[tokio::test]
    async fn test_redelivery_overwrites_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TransferFileWriter::new(dir.path().join("outbound"));

        let first = writer.write(&command(), "corr-1").await.unwrap();
        let second = writer.write(&command(), "corr-1").await.unwrap();

        assert_eq!(first, second);
        let entries: Vec<_> = std::fs::read_dir(writer.output_dir()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let content = std::fs::read_to_string(&first).unwrap();
        assert!(content.starts_with("POLICY_SUBMISSION|V1.0|"));
    }
}
