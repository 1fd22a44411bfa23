//! Zip archive assembly for one export job.
//!
//! Layout, one folder per top-level execution:
//!
//! ```text
//! {application}_{entity}_{start}_{id}{suffix}/
//!     execution.json | execution.yaml
//!     README.txt
//!     logs/{activityId}_{commandUnit}.log
//! ```
//!
//! Resolved sub-executions are embedded in their pipeline stage slot and
//! their logs land in the parent's folder.

use chrono::{DateTime, Utc};
use execport_ids::{ActivityId, ExecutionId, ExportJobId};
use execport_store::{
    format_millis, millis_to_datetime, ExecutionKind, OutputFormat, Requester,
    DISPLAY_TIMESTAMP_FORMAT,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::error::{ExportError, Result};
use crate::model::{Batch, ExecutionDetail, ExecutionRecord, InterruptRecord, LogLine};

pub const README_NAME: &str = "README.txt";
const SUFFIX_LEN: usize = 4;

/// Job-level facts repeated in every README.
#[derive(Debug, Clone)]
pub struct ArchiveContext {
    pub job_id: ExportJobId,
    pub requested_by: Requester,
    pub exported_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub download_link: String,
    pub format: OutputFormat,
}

/// A fully rendered zip entry.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub path: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub folders: usize,
    pub entries: usize,
}

pub struct ArchiveWriter {
    path: PathBuf,
    context: ArchiveContext,
    zip: Option<ZipWriter<File>>,
    folders: usize,
    entries: usize,
}

impl ArchiveWriter {
    /// Create (or truncate) the archive at `path`.
    pub async fn create(path: &Path, context: ArchiveContext) -> Result<Self> {
        let target = path.to_path_buf();
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            File::create(&target)
        })
        .await??;

        Ok(Self {
            path: path.to_path_buf(),
            context,
            zip: Some(ZipWriter::new(file)),
            folders: 0,
            entries: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Render every top-level record of `batch` and append it to the archive.
    pub async fn write_batch(&mut self, batch: &Batch) -> Result<()> {
        let mut entries = Vec::new();
        for idx in 0..batch.top_level_len() {
            entries.extend(render_execution(batch, idx, &self.context, &random_suffix())?);
        }

        let mut zip = self.zip.take().ok_or_else(already_finished)?;
        let count = entries.len();
        let (zip, written) = tokio::task::spawn_blocking(move || {
            let written = write_entries(&mut zip, &entries);
            (zip, written)
        })
        .await?;
        self.zip = Some(zip);
        written?;

        self.folders += batch.top_level_len();
        self.entries += count;
        debug!(
            job_id = %self.context.job_id,
            page = batch.page(),
            entries = count,
            "Batch written to archive"
        );
        Ok(())
    }

    /// Write the central directory and close the file.
    pub async fn finish(mut self) -> Result<ArchiveSummary> {
        let zip = self.zip.take().ok_or_else(already_finished)?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut file = zip.finish()?;
            file.flush()?;
            Ok(())
        })
        .await??;

        Ok(ArchiveSummary {
            path: self.path,
            folders: self.folders,
            entries: self.entries,
        })
    }
}

fn already_finished() -> ExportError {
    ExportError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "archive is already closed",
    ))
}

fn write_entries(zip: &mut ZipWriter<File>, entries: &[ArchiveEntry]) -> Result<()> {
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(6));
    for entry in entries {
        zip.start_file(entry.path.as_str(), options)?;
        zip.write_all(&entry.bytes)?;
    }
    Ok(())
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(char::from)
        .collect()
}

/// Replace anything outside `[A-Za-z0-9._-]` so names are safe as zip paths.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn folder_name(record: &ExecutionRecord, suffix: &str) -> String {
    let start = millis_to_datetime(record.start_time()).format("%Y-%m-%dT%H-%M-%S");
    format!(
        "{}_{}_{}_{}{}",
        sanitize_component(record.display_application()),
        sanitize_component(&record.entity_name),
        start,
        sanitize_component(record.id.as_str()),
        sanitize_component(suffix)
    )
}

/// Render the entries for top-level record `idx`: summary, README, then logs.
pub fn render_execution(
    batch: &Batch,
    idx: usize,
    context: &ArchiveContext,
    suffix: &str,
) -> Result<Vec<ArchiveEntry>> {
    let Some(record) = batch.get(idx) else {
        return Ok(Vec::new());
    };
    let folder = folder_name(record, suffix);

    let mut visited = HashSet::new();
    let summary = build_summary(batch, idx, &mut visited);
    let summary_name = format!("execution.{}", context.format.extension());
    let summary_bytes = match context.format {
        OutputFormat::Json => serde_json::to_vec_pretty(&summary)?,
        OutputFormat::Yaml => serde_yaml::to_string(&summary)?.into_bytes(),
    };

    // Logs from the record and every sub-execution it embeds.
    let mut log_files: BTreeMap<String, Vec<&LogLine>> = BTreeMap::new();
    for member in visited.iter().filter_map(|i| batch.get(*i)) {
        for node in &member.nodes {
            for line in &node.logs {
                log_files
                    .entry(log_file_name(&line.activity_id, &line.command_unit))
                    .or_default()
                    .push(line);
            }
        }
    }

    let mut attached = vec![summary_name.clone()];
    attached.extend(log_files.keys().cloned());
    let readme = render_readme(record, context, &attached);

    let mut entries = Vec::with_capacity(2 + log_files.len());
    entries.push(ArchiveEntry {
        path: format!("{}/{}", folder, summary_name),
        bytes: summary_bytes,
    });
    entries.push(ArchiveEntry {
        path: format!("{}/{}", folder, README_NAME),
        bytes: readme.into_bytes(),
    });
    for (name, mut lines) in log_files {
        lines.sort_by_key(|l| l.timestamp);
        let mut body = String::new();
        for line in lines {
            body.push_str(&format!(
                "{} [{}] {}\n",
                millis_to_datetime(line.timestamp).to_rfc3339(),
                line.level,
                line.message
            ));
        }
        entries.push(ArchiveEntry {
            path: format!("{}/{}", folder, name),
            bytes: body.into_bytes(),
        });
    }
    Ok(entries)
}

fn log_file_name(activity_id: &ActivityId, command_unit: &str) -> String {
    format!(
        "logs/{}_{}.log",
        sanitize_component(activity_id.as_str()),
        sanitize_component(command_unit)
    )
}

fn render_readme(record: &ExecutionRecord, context: &ArchiveContext, files: &[String]) -> String {
    let requester = match &context.requested_by.email {
        Some(email) => format!("{} <{}>", context.requested_by.name, email),
        None => context.requested_by.name.clone(),
    };
    let kind = match record.kind {
        ExecutionKind::Workflow => "Workflow",
        ExecutionKind::Pipeline => "Pipeline",
    };

    let mut out = String::new();
    out.push_str("Execution export\n");
    out.push_str("================\n\n");
    out.push_str(&format!("Execution:      {}\n", record.id));
    out.push_str(&format!("Application:    {}\n", record.display_application()));
    out.push_str(&format!("{:<16}{}\n", format!("{}:", kind), record.entity_name));
    out.push_str(&format!("Status:         {}\n", record.status));
    if let Some(started) = record.started_at.map(format_millis) {
        out.push_str(&format!("Started:        {}\n", started));
    }
    if let Some(ended) = record.ended_at.map(format_millis) {
        out.push_str(&format!("Ended:          {}\n", ended));
    }
    out.push('\n');
    out.push_str(&format!("Export request: {}\n", context.job_id));
    out.push_str(&format!(
        "Exported at:    {}\n",
        context.exported_at.format(DISPLAY_TIMESTAMP_FORMAT)
    ));
    out.push_str(&format!("Requested by:   {}\n", requester));
    out.push_str(&format!("Download link:  {}\n", context.download_link));
    out.push_str(&format!(
        "Link expires:   {}\n",
        context.expires_at.format(DISPLAY_TIMESTAMP_FORMAT)
    ));
    out.push_str("\nFiles:\n");
    for file in files {
        out.push_str(&format!("  {}\n", file));
    }
    out
}

#[derive(Serialize)]
struct ExecutionSummary<'a> {
    id: &'a ExecutionId,
    application_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    application_name: Option<&'a str>,
    entity_name: &'a str,
    kind: ExecutionKind,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    triggered_by: Option<&'a str>,
    created_at: Option<String>,
    started_at: Option<String>,
    ended_at: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stages: Vec<StageSummary<'a>>,
    nodes: &'a [ExecutionDetail],
    #[serde(skip_serializing_if = "is_empty_slice")]
    interrupts: &'a [InterruptRecord],
}

fn is_empty_slice<T>(items: &&[T]) -> bool {
    items.is_empty()
}

#[derive(Serialize)]
struct StageSummary<'a> {
    name: &'a str,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub_execution_id: Option<&'a ExecutionId>,
    /// Embedded only at the first stage that references the execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    sub_execution: Option<Box<ExecutionSummary<'a>>>,
}

/// Summary of arena record `idx` with resolved sub-executions inlined.
/// `visited` collects every arena index that ends up in the summary.
fn build_summary<'a>(
    batch: &'a Batch,
    idx: usize,
    visited: &mut HashSet<usize>,
) -> Option<ExecutionSummary<'a>> {
    let record = batch.get(idx)?;
    if !visited.insert(idx) {
        return None;
    }

    let stages = record
        .stages
        .iter()
        .map(|stage| StageSummary {
            name: &stage.name,
            status: &stage.status,
            sub_execution_id: stage.sub_execution_id.as_ref(),
            sub_execution: stage
                .resolved
                .and_then(|child| build_summary(batch, child, visited))
                .map(Box::new),
        })
        .collect();

    Some(ExecutionSummary {
        id: &record.id,
        application_id: &record.application_id,
        application_name: record.application_name.as_deref(),
        entity_name: &record.entity_name,
        kind: record.kind,
        status: &record.status,
        triggered_by: record.triggered_by.as_deref(),
        created_at: Some(format_millis(record.created_at)),
        started_at: record.started_at.map(format_millis),
        ended_at: record.ended_at.map(format_millis),
        stages,
        nodes: &record.nodes,
        interrupts: &record.interrupts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PipelineStage;
    use execport_ids::{AccountId, UserId};
    use std::io::Read;
    use tempfile::tempdir;

    fn record(id: &str, kind: ExecutionKind) -> ExecutionRecord {
        ExecutionRecord {
            id: ExecutionId::from(id),
            account_id: AccountId::from("acct"),
            application_id: "app-1".to_string(),
            application_name: Some("Payments API".to_string()),
            entity_name: "deploy/prod".to_string(),
            kind,
            status: "SUCCESS".to_string(),
            triggered_by: Some("ada".to_string()),
            created_at: 1_700_000_000_000,
            started_at: Some(1_700_000_001_000),
            ended_at: Some(1_700_000_060_000),
            parent_id: None,
            stages: Vec::new(),
            nodes: Vec::new(),
            interrupts: Vec::new(),
        }
    }

    fn node_with_logs(activity: &str) -> ExecutionDetail {
        ExecutionDetail {
            node_id: format!("node-{}", activity),
            name: "Shell".to_string(),
            node_type: "SHELL_SCRIPT".to_string(),
            status: "SUCCESS".to_string(),
            activity_id: Some(ActivityId::from(activity)),
            approval: None,
            sub_commands: Vec::new(),
            interrupts: Vec::new(),
            execution_context: Default::default(),
            logs: vec![
                LogLine {
                    activity_id: ActivityId::from(activity),
                    command_unit: "Execute".to_string(),
                    timestamp: 2,
                    level: "INFO".to_string(),
                    message: "second".to_string(),
                },
                LogLine {
                    activity_id: ActivityId::from(activity),
                    command_unit: "Execute".to_string(),
                    timestamp: 1,
                    level: "INFO".to_string(),
                    message: "first".to_string(),
                },
                LogLine {
                    activity_id: ActivityId::from(activity),
                    command_unit: "Init".to_string(),
                    timestamp: 0,
                    level: "INFO".to_string(),
                    message: "init".to_string(),
                },
            ],
        }
    }

    fn context(format: OutputFormat) -> ArchiveContext {
        ArchiveContext {
            job_id: ExportJobId::new(),
            requested_by: Requester {
                id: UserId::from("u1"),
                name: "Ada".to_string(),
                email: Some("ada@example.com".to_string()),
            },
            exported_at: Utc::now(),
            expires_at: Utc::now(),
            download_link: "https://example.com/dl/1".to_string(),
            format,
        }
    }

    #[test]
    fn test_folder_name_is_sanitized() {
        let name = folder_name(&record("exec 1", ExecutionKind::Workflow), "Ab3d");
        assert_eq!(name, "Payments_API_deploy_prod_2023-11-14T22-13-21_exec_1Ab3d");
    }

    #[test]
    fn test_pipeline_summary_embeds_sub_execution_and_its_logs() {
        let mut pipeline = record("p1", ExecutionKind::Pipeline);
        pipeline.stages.push(PipelineStage {
            name: "build".to_string(),
            status: "SUCCESS".to_string(),
            sub_execution_id: Some(ExecutionId::from("w1")),
            resolved: None,
        });
        let mut child = record("w1", ExecutionKind::Workflow);
        child.parent_id = Some(ExecutionId::from("p1"));
        child.nodes.push(node_with_logs("act-1"));

        let mut batch = Batch::new(0, vec![pipeline]);
        let idx = batch.insert_sub_execution(child);
        batch.records_mut()[0].stages[0].resolved = Some(idx);

        let entries = render_execution(&batch, 0, &context(OutputFormat::Json), "zzzz").unwrap();
        let names: Vec<_> = entries
            .iter()
            .map(|e| e.path.rsplit('/').next().unwrap().to_string())
            .collect();
        assert_eq!(names[0], "execution.json");
        assert_eq!(names[1], README_NAME);
        assert!(entries.iter().any(|e| e.path.ends_with("logs/act-1_Execute.log")));
        assert!(entries.iter().any(|e| e.path.ends_with("logs/act-1_Init.log")));

        let summary: serde_json::Value = serde_json::from_slice(&entries[0].bytes).unwrap();
        assert_eq!(summary["stages"][0]["sub_execution"]["id"], "w1");

        let execute = entries
            .iter()
            .find(|e| e.path.ends_with("act-1_Execute.log"))
            .unwrap();
        let body = String::from_utf8(execute.bytes.clone()).unwrap();
        let first = body.find("first").unwrap();
        let second = body.find("second").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_repeated_sub_execution_keeps_its_id_on_every_stage() {
        let mut pipeline = record("p1", ExecutionKind::Pipeline);
        for name in ["build", "rebuild"] {
            pipeline.stages.push(PipelineStage {
                name: name.to_string(),
                status: "SUCCESS".to_string(),
                sub_execution_id: Some(ExecutionId::from("w1")),
                resolved: None,
            });
        }
        let mut child = record("w1", ExecutionKind::Workflow);
        child.parent_id = Some(ExecutionId::from("p1"));

        let mut batch = Batch::new(0, vec![pipeline]);
        let idx = batch.insert_sub_execution(child);
        for stage in &mut batch.records_mut()[0].stages {
            stage.resolved = Some(idx);
        }

        let entries = render_execution(&batch, 0, &context(OutputFormat::Json), "zzzz").unwrap();
        let summary: serde_json::Value = serde_json::from_slice(&entries[0].bytes).unwrap();
        assert_eq!(summary["stages"][0]["sub_execution_id"], "w1");
        assert_eq!(summary["stages"][0]["sub_execution"]["id"], "w1");
        assert_eq!(summary["stages"][1]["sub_execution_id"], "w1");
        assert!(summary["stages"][1].get("sub_execution").is_none());
    }

    #[tokio::test]
    async fn test_archive_has_one_summary_and_readme_per_folder() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("staging").join("job.zip");

        let mut with_logs = record("e1", ExecutionKind::Workflow);
        with_logs.nodes.push(node_with_logs("act-9"));
        let batch = Batch::new(0, vec![with_logs, record("e2", ExecutionKind::Workflow)]);

        let mut writer = ArchiveWriter::create(&path, context(OutputFormat::Yaml))
            .await
            .unwrap();
        writer.write_batch(&batch).await.unwrap();
        let summary = writer.finish().await.unwrap();
        assert_eq!(summary.folders, 2);
        assert_eq!(summary.entries, 6);

        let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        let mut per_folder: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for i in 0..archive.len() {
            let name = archive.by_index(i).unwrap().name().to_string();
            let (folder, file) = name.split_once('/').unwrap();
            per_folder
                .entry(folder.to_string())
                .or_default()
                .push(file.to_string());
        }
        assert_eq!(per_folder.len(), 2);
        for files in per_folder.values() {
            assert_eq!(files.iter().filter(|f| *f == "execution.yaml").count(), 1);
            assert_eq!(files.iter().filter(|f| *f == README_NAME).count(), 1);
        }

        let readme_name = per_folder
            .iter()
            .find(|(folder, _)| folder.contains("_e1"))
            .map(|(folder, _)| format!("{}/{}", folder, README_NAME))
            .unwrap();
        let mut readme = String::new();
        archive
            .by_name(&readme_name)
            .unwrap()
            .read_to_string(&mut readme)
            .unwrap();
        assert!(readme.contains("Ada <ada@example.com>"));
        assert!(readme.contains("https://example.com/dl/1"));
        assert!(readme.contains("logs/act-9_Execute.log"));
    }
}
