//! Built-in tool implementations. Each returns a [`ToolExecution`]; expected
//! failures (network, missing files, nonzero ssh exits) are ordinary error
//! results, never panics.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use crate::{truncate_chars, AgentConfig, ToolExecution};

const HTTP_TIMEOUT_SECS: u64 = 30;

fn http_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
}

fn arg_str<'a>(args: &'a serde_json::Value, name: &str) -> Option<&'a str> {
    args.get(name).and_then(|v| v.as_str())
}

fn arg_usize(args: &serde_json::Value, name: &str, default: usize) -> usize {
    args.get(name)
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(default)
}

fn ok(output: String, details: serde_json::Value) -> ToolExecution {
    ToolExecution {
        output,
        details,
        is_error: false,
    }
}

// ── arXiv ────────────────────────────────────────────────────────────────

const ARXIV_API: &str = "https://export.arxiv.org/api/query";

pub(crate) fn arxiv_search(args: &serde_json::Value) -> Result<ToolExecution, String> {
    let query = arg_str(args, "query").ok_or("missing query")?;
    let limit = arg_usize(args, "limit", 5).min(25);
    let url = format!(
        "{ARXIV_API}?search_query=all:{}&max_results={limit}&sortBy=submittedDate&sortOrder=descending",
        urlencoding::encode(query)
    );
    let body = http_agent()
        .get(&url)
        .call()
        .map_err(|e| format!("arxiv request failed: {e}"))?
        .into_string()
        .map_err(|e| format!("arxiv response read failed: {e}"))?;

    let entries = parse_arxiv_entries(&body, limit);
    if entries.is_empty() {
        return Ok(ok(
            format!("No arXiv results for '{query}'."),
            serde_json::json!({ "count": 0 }),
        ));
    }
    let mut lines = vec![format!("arXiv results for '{query}':")];
    for (i, entry) in entries.iter().enumerate() {
        lines.push(format!(
            "{}. {} ({})\n   {}",
            i + 1,
            entry.title,
            entry.id,
            truncate_chars(&entry.summary, 240)
        ));
    }
    let details = serde_json::json!({
        "count": entries.len(),
        "entries": entries
            .iter()
            .map(|e| serde_json::json!({ "id": e.id, "title": e.title }))
            .collect::<Vec<_>>(),
    });
    Ok(ok(lines.join("\n"), details))
}

pub(crate) struct ArxivEntry {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) summary: String,
}

/// Minimal Atom scrape: enough structure for a chat summary, no XML crate.
pub(crate) fn parse_arxiv_entries(body: &str, limit: usize) -> Vec<ArxivEntry> {
    let mut entries = Vec::new();
    for chunk in body.split("<entry>").skip(1).take(limit) {
        let id = extract_tag(chunk, "id")
            .map(|s| s.rsplit('/').next().unwrap_or(&s).to_string())
            .unwrap_or_default();
        let title = extract_tag(chunk, "title")
            .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
            .unwrap_or_default();
        let summary = extract_tag(chunk, "summary")
            .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
            .unwrap_or_default();
        if !title.is_empty() {
            entries.push(ArxivEntry { id, title, summary });
        }
    }
    entries
}

fn extract_tag(chunk: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let start = chunk.find(&open)?;
    let after_open = chunk[start..].find('>')? + start + 1;
    let end = chunk[after_open..].find(&close)? + after_open;
    Some(chunk[after_open..end].trim().to_string())
}

pub(crate) fn paper_download(
    args: &serde_json::Value,
    cfg: &AgentConfig,
) -> Result<ToolExecution, String> {
    let arxiv_id = arg_str(args, "arxiv_id").ok_or("missing arxiv_id")?;
    if arxiv_id.contains('/') || arxiv_id.contains("..") {
        return Err("arxiv_id must be a bare identifier".to_string());
    }
    let url = format!("https://arxiv.org/pdf/{arxiv_id}");
    let resp = http_agent()
        .get(&url)
        .call()
        .map_err(|e| format!("download failed: {e}"))?;
    let mut bytes = Vec::new();
    resp.into_reader()
        .read_to_end(&mut bytes)
        .map_err(|e| format!("download read failed: {e}"))?;

    let dir = cfg.workspace.join("papers");
    fs::create_dir_all(&dir).map_err(|e| format!("create papers dir: {e}"))?;
    let path = dir.join(format!("{arxiv_id}.pdf"));
    fs::write(&path, &bytes).map_err(|e| format!("write pdf: {e}"))?;
    Ok(ok(
        format!("Downloaded {arxiv_id} ({} KB) to {}", bytes.len() / 1024, path.display()),
        serde_json::json!({ "path": path.display().to_string(), "bytes": bytes.len() }),
    ))
}

// ── Calendar ─────────────────────────────────────────────────────────────

pub(crate) fn calendar_briefing(
    args: &serde_json::Value,
    cfg: &AgentConfig,
) -> Result<ToolExecution, String> {
    let path = cfg
        .calendar_path
        .as_ref()
        .ok_or("LODESTAR_CALENDAR_PATH is not configured")?;
    let date = arg_str(args, "date")
        .map(|s| s.to_string())
        .unwrap_or_else(|| chrono::Utc::now().format("%Y-%m-%d").to_string());

    let raw = fs::read_to_string(path).map_err(|e| format!("read calendar: {e}"))?;
    let events: Vec<serde_json::Value> =
        serde_json::from_str(&raw).map_err(|e| format!("parse calendar: {e}"))?;

    let mut lines = Vec::new();
    for event in &events {
        let start = event.get("start").and_then(|v| v.as_str()).unwrap_or("");
        if !start.starts_with(&date) {
            continue;
        }
        let title = event.get("title").and_then(|v| v.as_str()).unwrap_or("(untitled)");
        let location = event.get("location").and_then(|v| v.as_str());
        match location {
            Some(loc) => lines.push(format!("- {start}: {title} @ {loc}")),
            None => lines.push(format!("- {start}: {title}")),
        }
    }
    let output = if lines.is_empty() {
        format!("No events on {date}.")
    } else {
        format!("Schedule for {date}:\n{}", lines.join("\n"))
    };
    Ok(ok(output, serde_json::json!({ "date": date, "count": lines.len() })))
}

// ── Mail ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MailCategory {
    Urgent,
    Action,
    Newsletter,
    Promo,
    Other,
}

impl MailCategory {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::Action => "action",
            Self::Newsletter => "newsletter",
            Self::Promo => "promo",
            Self::Other => "other",
        }
    }
}

/// Keyword classifier for the mail digest. Content policy, not gate state.
pub(crate) fn classify_mail(subject: &str, body: &str) -> MailCategory {
    let text = format!("{} {}", subject.to_lowercase(), body.to_lowercase());
    const URGENT: &[&str] = &["urgent", "asap", "immediately", "deadline today", "action required"];
    const ACTION: &[&str] = &["please review", "deadline", "respond by", "rsvp", "due "];
    const PROMO: &[&str] = &["% off", "sale", "discount", "coupon", "limited time", "deal"];
    const NEWSLETTER: &[&str] = &["newsletter", "digest", "weekly update", "unsubscribe"];
    if URGENT.iter().any(|k| text.contains(k)) {
        MailCategory::Urgent
    } else if ACTION.iter().any(|k| text.contains(k)) {
        MailCategory::Action
    } else if PROMO.iter().any(|k| text.contains(k)) {
        MailCategory::Promo
    } else if NEWSLETTER.iter().any(|k| text.contains(k)) {
        MailCategory::Newsletter
    } else {
        MailCategory::Other
    }
}

fn read_spool(dir: &Path) -> Result<Vec<(String, serde_json::Value)>, String> {
    let mut mails = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| format!("read mail dir: {e}"))?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
            continue;
        };
        let Ok(raw) = fs::read_to_string(&path) else {
            continue;
        };
        let Ok(mail) = serde_json::from_str::<serde_json::Value>(&raw) else {
            eprintln!("[mail] skipping malformed spool entry {}", path.display());
            continue;
        };
        mails.push((id, mail));
    }
    mails.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(mails)
}

pub(crate) fn mail_digest(
    args: &serde_json::Value,
    cfg: &AgentConfig,
) -> Result<ToolExecution, String> {
    let dir = cfg.mail_dir.as_ref().ok_or("LODESTAR_MAIL_DIR is not configured")?;
    let limit = arg_usize(args, "limit", 20);
    let mails = read_spool(dir)?;

    let mut counts = [0usize; 5];
    let mut highlights = Vec::new();
    for (id, mail) in mails.iter().take(limit) {
        let subject = mail.get("subject").and_then(|v| v.as_str()).unwrap_or("");
        let body = mail.get("body").and_then(|v| v.as_str()).unwrap_or("");
        let from = mail.get("from").and_then(|v| v.as_str()).unwrap_or("unknown");
        let category = classify_mail(subject, body);
        counts[category as usize] += 1;
        if matches!(category, MailCategory::Urgent | MailCategory::Action) {
            highlights.push(format!("- [{}] {id}: {subject} (from {from})", category.as_str()));
        }
    }
    let total: usize = counts.iter().sum();
    let mut output = format!(
        "{total} messages: {} urgent, {} action, {} newsletter, {} promo, {} other.",
        counts[0], counts[1], counts[2], counts[3], counts[4]
    );
    if !highlights.is_empty() {
        output.push_str("\nNeeds attention:\n");
        output.push_str(&highlights.join("\n"));
    }
    Ok(ok(
        output,
        serde_json::json!({
            "total": total,
            "urgent": counts[0],
            "action": counts[1],
        }),
    ))
}

pub(crate) fn mail_archive(
    args: &serde_json::Value,
    cfg: &AgentConfig,
) -> Result<ToolExecution, String> {
    let dir = cfg.mail_dir.as_ref().ok_or("LODESTAR_MAIL_DIR is not configured")?;
    let id = arg_str(args, "id").ok_or("missing id")?;
    if id.contains('/') || id.contains("..") {
        return Err("id must be a bare message id".to_string());
    }
    let src = dir.join(format!("{id}.json"));
    if !src.exists() {
        return Err(format!("no such message: {id}"));
    }
    let archive = dir.join("archive");
    fs::create_dir_all(&archive).map_err(|e| format!("create archive dir: {e}"))?;
    let dst = archive.join(format!("{id}.json"));
    fs::rename(&src, &dst).map_err(|e| format!("archive move failed: {e}"))?;
    Ok(ok(
        format!("Archived message {id}."),
        serde_json::json!({ "id": id }),
    ))
}

pub(crate) fn mail_send_reply(
    args: &serde_json::Value,
    cfg: &AgentConfig,
) -> Result<ToolExecution, String> {
    let dir = cfg.mail_dir.as_ref().ok_or("LODESTAR_MAIL_DIR is not configured")?;
    let id = arg_str(args, "id").ok_or("missing id")?;
    let body = arg_str(args, "body").ok_or("missing body")?;
    if id.contains('/') || id.contains("..") {
        return Err("id must be a bare message id".to_string());
    }
    let outbox = dir.join("outbox");
    fs::create_dir_all(&outbox).map_err(|e| format!("create outbox dir: {e}"))?;
    let path = outbox.join(format!("{id}-reply.json"));
    let payload = serde_json::json!({
        "in_reply_to": id,
        "body": body,
        "queued_at": chrono::Utc::now().to_rfc3339(),
    });
    fs::write(&path, serde_json::to_vec_pretty(&payload).map_err(|e| e.to_string())?)
        .map_err(|e| format!("write reply: {e}"))?;
    Ok(ok(
        format!("Reply to {id} queued in outbox."),
        serde_json::json!({ "path": path.display().to_string() }),
    ))
}

// ── HPC ──────────────────────────────────────────────────────────────────

fn ssh_command(cfg: &AgentConfig, remote: &str) -> Result<Command, String> {
    let host = cfg.hpc_host.as_ref().ok_or("LODESTAR_HPC_HOST is not configured")?;
    let mut cmd = Command::new("ssh");
    if let Some(raw) = &cfg.hpc_ssh_args {
        let extra = shlex::split(raw).ok_or("unparsable LODESTAR_HPC_SSH_ARGS")?;
        cmd.args(extra);
    }
    cmd.arg(host).arg(remote);
    Ok(cmd)
}

fn run_ssh(cfg: &AgentConfig, remote: &str) -> Result<String, String> {
    let output = ssh_command(cfg, remote)?
        .output()
        .map_err(|e| format!("ssh spawn failed: {e}"))?;
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !output.status.success() {
        let code = output.status.code().unwrap_or(-1);
        return Err(format!("ssh exited {code}: {stderr}"));
    }
    Ok(stdout)
}

pub(crate) fn hpc_queue(
    _args: &serde_json::Value,
    cfg: &AgentConfig,
) -> Result<ToolExecution, String> {
    let stdout = run_ssh(cfg, "squeue --me -h -o '%i %j %T %M'")?;
    let jobs: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
    let output = if jobs.is_empty() {
        "No jobs in the queue.".to_string()
    } else {
        format!("{} job(s) in the queue:\n{}", jobs.len(), jobs.join("\n"))
    };
    Ok(ok(output, serde_json::json!({ "count": jobs.len() })))
}

pub(crate) fn hpc_job_status(
    args: &serde_json::Value,
    cfg: &AgentConfig,
) -> Result<ToolExecution, String> {
    let job_id = arg_str(args, "job_id").ok_or("missing job_id")?;
    if !job_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err("job_id must be alphanumeric".to_string());
    }
    let stdout = run_ssh(cfg, &format!("squeue -j {job_id} -h -o '%i %j %T %M %R'"))?;
    let output = if stdout.trim().is_empty() {
        format!("Job {job_id} is not in the queue (finished or unknown).")
    } else {
        format!("Job {job_id}: {}", stdout.trim())
    };
    Ok(ok(output, serde_json::json!({ "job_id": job_id })))
}

pub(crate) fn hpc_submit(
    args: &serde_json::Value,
    cfg: &AgentConfig,
) -> Result<ToolExecution, String> {
    let script = arg_str(args, "script").ok_or("missing script")?;
    if script.contains(';') || script.contains('|') || script.contains('&') {
        return Err("script must be a plain path on the remote host".to_string());
    }
    let stdout = run_ssh(cfg, &format!("sbatch {script}"))?;
    Ok(ok(
        stdout.clone(),
        serde_json::json!({ "script": script, "sbatch": stdout }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_mail_categories() {
        assert_eq!(
            classify_mail("URGENT: server down", "please fix asap"),
            MailCategory::Urgent
        );
        assert_eq!(
            classify_mail("Please review the draft", "respond by friday"),
            MailCategory::Action
        );
        assert_eq!(
            classify_mail("50% off everything", "limited time deal"),
            MailCategory::Promo
        );
        assert_eq!(
            classify_mail("Weekly update", "unsubscribe link below"),
            MailCategory::Newsletter
        );
        assert_eq!(classify_mail("lunch?", "want to grab food"), MailCategory::Other);
    }

    #[test]
    fn parse_arxiv_atom() {
        let body = r#"<?xml version="1.0"?><feed>
            <entry>
              <id>http://arxiv.org/abs/2401.01234v1</id>
              <title>Skyrmion  Dynamics
                in Thin Films</title>
              <summary>We study skyrmions.</summary>
            </entry>
            <entry>
              <id>http://arxiv.org/abs/2401.05678v2</id>
              <title>Second Paper</title>
              <summary>Another abstract.</summary>
            </entry></feed>"#;
        let entries = parse_arxiv_entries(body, 5);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "2401.01234v1");
        assert_eq!(entries[0].title, "Skyrmion Dynamics in Thin Films");
        assert_eq!(entries[1].summary, "Another abstract.");
    }

    #[test]
    fn mail_digest_counts_and_archive() {
        let dir = std::env::temp_dir().join(format!("lodestar_mail_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("m1.json"),
            r#"{"from":"pi@uni.edu","subject":"URGENT: grant deadline","body":"asap please"}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("m2.json"),
            r#"{"from":"store@shop.com","subject":"Big sale","body":"50% off"}"#,
        )
        .unwrap();

        let cfg = AgentConfig {
            mail_dir: Some(dir.clone()),
            ..AgentConfig::default()
        };
        let exec = mail_digest(&serde_json::json!({}), &cfg).unwrap();
        assert!(!exec.is_error);
        assert!(exec.output.contains("2 messages"));
        assert!(exec.output.contains("m1"));
        assert_eq!(exec.details["urgent"], 1);

        let archived = mail_archive(&serde_json::json!({ "id": "m1" }), &cfg).unwrap();
        assert!(!archived.is_error);
        assert!(dir.join("archive/m1.json").exists());
        assert!(!dir.join("m1.json").exists());

        // Unknown id is an expected failure
        assert!(mail_archive(&serde_json::json!({ "id": "m1" }), &cfg).is_err());
        // Path traversal is refused
        assert!(mail_archive(&serde_json::json!({ "id": "../m2" }), &cfg).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn calendar_briefing_filters_by_date() {
        let dir = std::env::temp_dir().join(format!("lodestar_cal_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("calendar.json");
        std::fs::write(
            &path,
            r#"[
                {"start": "2026-09-01 10:00", "title": "Group meeting", "location": "SES 2214"},
                {"start": "2026-09-02 14:00", "title": "Defense rehearsal"}
            ]"#,
        )
        .unwrap();
        let cfg = AgentConfig {
            calendar_path: Some(path),
            ..AgentConfig::default()
        };
        let exec =
            calendar_briefing(&serde_json::json!({ "date": "2026-09-01" }), &cfg).unwrap();
        assert!(exec.output.contains("Group meeting"));
        assert!(!exec.output.contains("Defense rehearsal"));

        let empty =
            calendar_briefing(&serde_json::json!({ "date": "2026-12-25" }), &cfg).unwrap();
        assert!(empty.output.contains("No events"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unconfigured_tools_fail_cleanly() {
        let cfg = AgentConfig::default();
        assert!(mail_digest(&serde_json::json!({}), &cfg).is_err());
        assert!(calendar_briefing(&serde_json::json!({}), &cfg).is_err());
        assert!(hpc_queue(&serde_json::json!({}), &cfg).is_err());
    }
}
