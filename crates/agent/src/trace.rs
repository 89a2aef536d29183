//! Computer-use run traces.
//!
//! Layout under the trace root:
//! `<run_id>/{config.json, timeline.jsonl, steps/<NNNN>.{json,png},
//! replay/{actions.jsonl, run.sh, README.md}}`. The timeline is
//! append-only JSONL, one item per line; `computer_call` items are mirrored
//! into the replay action log. A finished run can be exported as a single
//! `.tar.gz` bundle.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;

use af_domain::computer::{ComputerCall, Observation};
use af_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trace writer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TraceWriter {
    run_dir: PathBuf,
    timeline_path: PathBuf,
    steps_dir: PathBuf,
    replay_actions_path: PathBuf,
    history: VecDeque<Value>,
    history_window: usize,
}

impl TraceWriter {
    /// Append a timeline item; `computer_call` items also land in the
    /// replay action log.
    pub fn append_item(&mut self, item: Value) -> Result<()> {
        let line = serde_json::to_string(&item)?;
        append_line(&self.timeline_path, &line)?;
        if item.get("type").and_then(|t| t.as_str()) == Some("computer_call") {
            append_line(&self.replay_actions_path, &line)?;
        }
        if self.history.len() >= self.history_window {
            self.history.pop_front();
        }
        self.history.push_back(item);
        Ok(())
    }

    /// The recent timeline window fed back into decision requests.
    pub fn recent_history(&self) -> Vec<Value> {
        self.history.iter().cloned().collect()
    }

    fn seed_history(&mut self, items: Vec<Value>) {
        self.history.clear();
        let skip = items.len().saturating_sub(self.history_window);
        for item in items.into_iter().skip(skip) {
            self.history.push_back(item);
        }
    }

    /// Persist one executed step: screenshot bytes plus a JSON record.
    pub fn write_step(
        &self,
        step_index: u32,
        step_id: &str,
        call: &ComputerCall,
        output: &Observation,
        response_id: &str,
        redact_action: bool,
    ) -> Result<()> {
        let filename = format!("{step_index:04}");
        let screenshot_name = format!("{filename}.png");

        if !output.screenshot_b64.is_empty() {
            let bytes = BASE64
                .decode(output.screenshot_b64.as_bytes())
                .map_err(|e| Error::Other(format!("undecodable screenshot: {e}")))?;
            std::fs::write(self.steps_dir.join(&screenshot_name), bytes)?;
        }

        let call_json = if redact_action {
            call.to_redacted_json()
        } else {
            serde_json::json!({
                "type": "computer_call",
                "call_id": call.call_id,
                "action": serde_json::to_value(&call.action)?,
                "meta": serde_json::to_value(&call.meta)?,
                "pending_safety_checks": serde_json::to_value(&call.pending_safety_checks)?,
            })
        };
        let payload = serde_json::json!({
            "step_id": step_id,
            "step_index": step_index,
            "call_id": call.call_id,
            "response_id": response_id,
            "action": call_json["action"],
            "meta": call_json["meta"],
            "pending_safety_checks": call_json["pending_safety_checks"],
            "output_url": output.url,
            "output_viewport": serde_json::to_value(output.viewport)?,
            "execution": serde_json::to_value(&output.execution)?,
            "screenshot_path": screenshot_name,
        });
        std::fs::write(
            self.steps_dir.join(format!("{filename}.json")),
            serde_json::to_vec_pretty(&payload)?,
        )?;
        Ok(())
    }

    /// Human-readable end-of-run report.
    pub fn write_report(&self, report: &Value) -> Result<()> {
        let mut lines = vec!["# Computer-Use Run Report".to_string(), String::new()];
        let status = report
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or("unknown");
        lines.push(format!("Status: {status}"));
        if let Some(reason) = report.get("stop_reason").and_then(|s| s.as_str()) {
            if !reason.is_empty() {
                lines.push(format!("Stop reason: {reason}"));
            }
        }
        if let Some(summary) = report.get("summary").and_then(|s| s.as_str()) {
            lines.push(String::new());
            lines.push(summary.to_string());
        }
        if let Some(url) = report.get("last_url").and_then(|s| s.as_str()) {
            lines.push(format!("Last URL: {url}"));
        }
        if let Some(steps) = report.get("steps") {
            lines.push(format!("Steps: {steps}"));
        }
        if let Some(error) = report.get("error").and_then(|s| s.as_str()) {
            lines.push(format!("Error: {error}"));
        }
        std::fs::write(self.run_dir.join("report.md"), lines.join("\n") + "\n")?;
        Ok(())
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Bundle the whole run directory into `<run_id>.tar.gz` next to it.
    pub fn export_bundle(&self) -> Result<PathBuf> {
        let bundle_path = self.run_dir.with_extension("tar.gz");
        let file = std::fs::File::create(&bundle_path)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let name = self
            .run_dir
            .file_name()
            .ok_or_else(|| Error::Other("trace run dir has no name".into()))?;
        builder.append_dir_all(name, &self.run_dir)?;
        builder
            .into_inner()
            .and_then(|encoder| encoder.finish())
            .map_err(Error::Io)?;
        Ok(bundle_path)
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trace store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TraceStore {
    root: PathBuf,
    history_window: usize,
}

impl TraceStore {
    pub fn new(root: impl Into<PathBuf>, history_window: usize) -> Self {
        Self {
            root: root.into(),
            history_window: history_window.max(1),
        }
    }

    fn writer_paths(&self, run_id: &str) -> (PathBuf, PathBuf, PathBuf, PathBuf) {
        let run_dir = self.root.join(run_id);
        (
            run_dir.clone(),
            run_dir.join("timeline.jsonl"),
            run_dir.join("steps"),
            run_dir.join("replay"),
        )
    }

    /// Create the run layout and seed the replay helpers.
    pub fn start_run(&self, run_id: &str, config_snapshot: &Value) -> Result<TraceWriter> {
        let (run_dir, timeline_path, steps_dir, replay_dir) = self.writer_paths(run_id);
        std::fs::create_dir_all(&steps_dir)?;
        std::fs::create_dir_all(&replay_dir)?;

        std::fs::write(&timeline_path, "")?;
        std::fs::write(replay_dir.join("actions.jsonl"), "")?;
        std::fs::write(
            run_dir.join("config.json"),
            serde_json::to_vec_pretty(config_snapshot)?,
        )?;
        std::fs::write(
            replay_dir.join("README.md"),
            "Replay package for computer-use actions.\n\
             Use actions.jsonl with the replay runner to re-execute steps.\n\
             Example:\n\
             astraforge computer-use replay --trace-dir .. --sandbox-session-id <SANDBOX_SESSION_ID>\n",
        )?;
        std::fs::write(
            replay_dir.join("run.sh"),
            "#!/bin/sh\n\
             astraforge computer-use replay --trace-dir .. --sandbox-session-id \"$1\"\n",
        )?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(
                replay_dir.join("run.sh"),
                std::fs::Permissions::from_mode(0o755),
            );
        }

        Ok(TraceWriter {
            run_dir,
            timeline_path,
            steps_dir,
            replay_actions_path: replay_dir.join("actions.jsonl"),
            history: VecDeque::new(),
            history_window: self.history_window,
        })
    }

    /// Reopen an existing run, seeding the history window from the tail of
    /// the timeline.
    pub fn open_run(&self, run_id: &str) -> Result<TraceWriter> {
        let (run_dir, timeline_path, steps_dir, replay_dir) = self.writer_paths(run_id);
        std::fs::create_dir_all(&steps_dir)?;
        std::fs::create_dir_all(&replay_dir)?;
        if !timeline_path.exists() {
            std::fs::write(&timeline_path, "")?;
        }
        let actions = replay_dir.join("actions.jsonl");
        if !actions.exists() {
            std::fs::write(&actions, "")?;
        }

        let mut writer = TraceWriter {
            run_dir,
            timeline_path: timeline_path.clone(),
            steps_dir,
            replay_actions_path: actions,
            history: VecDeque::new(),
            history_window: self.history_window,
        };
        writer.seed_history(tail_jsonl(&timeline_path, self.history_window));
        Ok(writer)
    }
}

/// Last `limit` decodable items of a JSONL file.
pub fn tail_jsonl(path: &Path, limit: usize) -> Vec<Value> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    let skip = lines.len().saturating_sub(limit);
    lines[skip..]
        .iter()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(|v| v.is_object())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_domain::computer::{ComputerAction, ExecutionResult, Viewport};

    fn observation(call_id: &str) -> Observation {
        Observation {
            call_id: call_id.into(),
            url: "https://example.com".into(),
            viewport: Viewport { w: 1280, h: 720 },
            screenshot_b64: BASE64.encode(b"png-bytes"),
            execution: ExecutionResult::ok(),
        }
    }

    #[test]
    fn start_run_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path(), 10);
        let writer = store
            .start_run("run-1", &serde_json::json!({"goal": "demo"}))
            .unwrap();

        let run_dir = writer.run_dir();
        assert!(run_dir.join("config.json").exists());
        assert!(run_dir.join("timeline.jsonl").exists());
        assert!(run_dir.join("steps").is_dir());
        assert!(run_dir.join("replay/actions.jsonl").exists());
        assert!(run_dir.join("replay/run.sh").exists());
        assert!(run_dir.join("replay/README.md").exists());
    }

    #[test]
    fn computer_calls_mirror_into_replay_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path(), 10);
        let mut writer = store.start_run("run-1", &serde_json::json!({})).unwrap();

        writer
            .append_item(serde_json::json!({"type": "computer_call", "call_id": "c1"}))
            .unwrap();
        writer
            .append_item(serde_json::json!({"type": "policy_decision", "decision": "allow"}))
            .unwrap();

        let timeline =
            std::fs::read_to_string(writer.run_dir().join("timeline.jsonl")).unwrap();
        assert_eq!(timeline.lines().count(), 2);
        let actions =
            std::fs::read_to_string(writer.run_dir().join("replay/actions.jsonl")).unwrap();
        assert_eq!(actions.lines().count(), 1);
        assert!(actions.contains("c1"));
    }

    #[test]
    fn history_window_is_bounded_and_reseeded() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path(), 3);
        let mut writer = store.start_run("run-1", &serde_json::json!({})).unwrap();
        for i in 0..6 {
            writer
                .append_item(serde_json::json!({"type": "note", "i": i}))
                .unwrap();
        }
        let history = writer.recent_history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0]["i"], 3);

        // Reopen: history comes back from the timeline tail.
        let reopened = store.open_run("run-1").unwrap();
        let history = reopened.recent_history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2]["i"], 5);
    }

    #[test]
    fn write_step_persists_screenshot_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path(), 10);
        let writer = store.start_run("run-1", &serde_json::json!({})).unwrap();

        let call = ComputerCall::new(ComputerAction::VisitUrl {
            url: "https://example.com".into(),
        });
        writer
            .write_step(1, "step-1", &call, &observation(&call.call_id), "resp-1", false)
            .unwrap();

        let steps = writer.run_dir().join("steps");
        assert!(steps.join("0001.png").exists());
        let record: Value =
            serde_json::from_slice(&std::fs::read(steps.join("0001.json")).unwrap()).unwrap();
        assert_eq!(record["step_index"], 1);
        assert_eq!(record["screenshot_path"], "0001.png");
        assert_eq!(record["action"]["type"], "visit_url");
        assert_eq!(record["execution"]["status"], "ok");
    }

    #[test]
    fn write_step_redacts_typed_text() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path(), 10);
        let writer = store.start_run("run-1", &serde_json::json!({})).unwrap();

        let call = ComputerCall::new(ComputerAction::Type {
            x: 5,
            y: 5,
            text: "hunter2".into(),
        });
        writer
            .write_step(1, "step-1", &call, &observation(&call.call_id), "resp-1", true)
            .unwrap();

        let record: Value = serde_json::from_slice(
            &std::fs::read(writer.run_dir().join("steps/0001.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(record["action"]["text"], "[REDACTED]");
        assert!(record["action"]["text_sha256"].is_string());
    }

    #[test]
    fn report_and_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path(), 10);
        let mut writer = store.start_run("run-1", &serde_json::json!({})).unwrap();
        writer
            .append_item(serde_json::json!({"type": "computer_call", "call_id": "c1"}))
            .unwrap();
        writer
            .write_report(&serde_json::json!({
                "status": "completed",
                "stop_reason": "completed",
                "steps": 1,
                "last_url": "https://example.com",
            }))
            .unwrap();

        assert!(writer.run_dir().join("report.md").exists());
        let report = std::fs::read_to_string(writer.run_dir().join("report.md")).unwrap();
        assert!(report.contains("Status: completed"));

        let bundle = writer.export_bundle().unwrap();
        assert!(bundle.exists());
        assert!(bundle.to_string_lossy().ends_with("run-1.tar.gz"));
        // The bundle is a valid gzip tar containing the run directory.
        let file = std::fs::File::open(&bundle).unwrap();
        let decoder = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.iter().any(|n| n.contains("timeline.jsonl")));
    }

    #[test]
    fn tail_jsonl_skips_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, "{\"a\":1}\nnot json\n{\"a\":2}\n").unwrap();
        let items = tail_jsonl(&path, 10);
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["a"], 2);
    }
}
