// tests/campaign.rs
//
// End-to-end tests against a mock scan-management service speaking the real
// XML protocol over a Unix socket.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch};

use aegiscan::core::campaign::CampaignAggregator;
use aegiscan::core::error::ScanError;
use aegiscan::core::gmp::{self, xml_complete};
use aegiscan::core::lifecycle::{ScanLifecycleController, ScanParams};
use aegiscan::core::models::{
    AuxScanResult, CampaignEvent, ExploitOutcome, SourceTool, TaskStatus,
};

const OPENVAS_CSV: &str = "\
IP,Hostname,Port,CVSS,Severity,NVT Name,Summary,Solution,NVT OID
10.0.0.1,,80,7.5,High,Plugin One,First issue,Patch it,PLUGIN-1
10.0.0.2,,80,7.5,High,Plugin One,First issue,Patch it,PLUGIN-1
10.0.0.3,,443,5.0,Medium,Plugin Two,Second issue,Harden it,PLUGIN-2
10.0.0.1,,22,0.0,Log,Plugin Three,Banner,None,PLUGIN-3
10.0.0.1,,25,0.0,Log,Plugin Four,Banner,None,PLUGIN-4
";

const NIKTO_CSV: &str = "\
\"Nikto v2.5.0\",,,,,,
10.0.0.5,target.example,80,CWE-16,GET,/cgi-bin/,Directory indexing found
10.0.0.5,target.example,80,CWE-16,GET,/icons/,Directory indexing found
";

#[derive(Default)]
struct MockState {
    targets: Vec<(String, String)>,
    created_targets: usize,
    created_tasks: usize,
    statuses: VecDeque<&'static str>,
    polls: usize,
    fail_pdf: bool,
    fail_csv: bool,
}

fn summary_xml() -> String {
    "<get_reports_response status=\"200\"><report id=\"rep-1\"><report>\
     <hosts><count>3</count></hosts>\
     <os><count>2</count></os>\
     <apps><count>4</count></apps>\
     <results>\
     <result><original_threat>High</original_threat></result>\
     <result><original_threat>High</original_threat></result>\
     <result><original_threat>Medium</original_threat></result>\
     <result><original_threat>Log</original_threat></result>\
     <result><original_threat>Log</original_threat></result>\
     </results></report></report></get_reports_response>"
        .to_string()
}

fn payload_response(content_type: &str, bytes: &[u8]) -> String {
    format!(
        "<get_reports_response status=\"200\">\
         <report id=\"rep-1\" content_type=\"{content_type}\">\
         <report_format id=\"fmt-1\"></report_format>{}</report>\
         </get_reports_response>",
        BASE64.encode(bytes)
    )
}

fn not_found() -> String {
    "<get_reports_response status=\"404\" status_text=\"Failed to find report format\"/>"
        .to_string()
}

fn extract_element(command: &str, tag: &str) -> String {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    command
        .split(&open)
        .nth(1)
        .and_then(|rest| rest.split(&close).next())
        .unwrap_or_default()
        .to_string()
}

fn respond(command: &str, state: &mut MockState) -> String {
    if command.starts_with("<authenticate") {
        "<authenticate_response status=\"200\" status_text=\"OK\"/>".to_string()
    } else if command.starts_with("<get_targets") {
        let body: String = state
            .targets
            .iter()
            .map(|(id, name)| format!("<target id=\"{id}\"><name>{name}</name></target>"))
            .collect();
        format!(
            "<get_targets_response status=\"200\" status_text=\"OK\">{body}</get_targets_response>"
        )
    } else if command.starts_with("<create_target") {
        state.created_targets += 1;
        let id = format!("target-{}", state.created_targets);
        let name = extract_element(command, "name");
        state.targets.push((id.clone(), name));
        format!(
            "<create_target_response status=\"201\" status_text=\"OK, resource created\" id=\"{id}\"/>"
        )
    } else if command.starts_with("<create_task") {
        state.created_tasks += 1;
        format!(
            "<create_task_response status=\"201\" status_text=\"OK, resource created\" id=\"task-{}\"/>",
            state.created_tasks
        )
    } else if command.starts_with("<start_task") {
        "<start_task_response status=\"202\" status_text=\"OK, request submitted\">\
         <report_id>rep-1</report_id></start_task_response>"
            .to_string()
    } else if command.starts_with("<get_tasks") {
        state.polls += 1;
        let status = if state.statuses.len() > 1 {
            state.statuses.pop_front().unwrap()
        } else {
            *state.statuses.front().expect("mock status script is empty")
        };
        format!(
            "<get_tasks_response status=\"200\"><task id=\"task-1\">\
             <status>{status}</status></task></get_tasks_response>"
        )
    } else if command.starts_with("<get_reports") {
        if command.contains(gmp::XML_REPORT_FORMAT_ID) {
            summary_xml()
        } else if command.contains(gmp::PDF_REPORT_FORMAT_ID) {
            if state.fail_pdf {
                not_found()
            } else {
                payload_response("application/pdf", b"%PDF-1.4 stub")
            }
        } else if state.fail_csv {
            not_found()
        } else {
            payload_response("text/csv", OPENVAS_CSV.as_bytes())
        }
    } else {
        "<error_response status=\"400\" status_text=\"unknown command\"/>".to_string()
    }
}

async fn serve(listener: UnixListener, state: Arc<Mutex<MockState>>) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let state = state.clone();
        tokio::spawn(async move {
            let mut buf = Vec::new();
            loop {
                let mut chunk = [0u8; 4096];
                let n = match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&chunk[..n]);
                if xml_complete(&buf) {
                    let command = String::from_utf8_lossy(&buf).into_owned();
                    buf.clear();
                    let response = respond(&command, &mut state.lock().unwrap());
                    if stream.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        });
    }
}

struct Harness {
    _dir: TempDir,
    state: Arc<Mutex<MockState>>,
    params: ScanParams,
    state_dir: PathBuf,
}

fn setup(statuses: &[&'static str], hosts: &str) -> Harness {
    let dir = TempDir::new().unwrap();
    let socket_path = dir.path().join("gvmd.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();
    let state = Arc::new(Mutex::new(MockState {
        statuses: statuses.iter().copied().collect(),
        ..MockState::default()
    }));
    tokio::spawn(serve(listener, state.clone()));

    let hosts_file = dir.path().join("targets.txt");
    std::fs::write(&hosts_file, hosts).unwrap();
    let params = ScanParams {
        socket_path,
        username: "admin".to_string(),
        password: "secret".to_string(),
        target_name: "lab".to_string(),
        hosts_file,
        port_list_id: "pl-1".to_string(),
        task_name: "weekly".to_string(),
        scan_config_id: "cfg-1".to_string(),
        scanner_id: "sc-1".to_string(),
        reports_dir: dir.path().join("openvas_reports"),
    };
    let state_dir = dir.path().to_path_buf();
    Harness {
        _dir: dir,
        state,
        params,
        state_dir,
    }
}

fn fast_controller() -> ScanLifecycleController {
    ScanLifecycleController::with_intervals(Duration::from_millis(5), Duration::from_millis(1))
}

fn json_file(path: PathBuf) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn campaign_end_to_end_against_a_mock_service() {
    let h = setup(
        &["Requested", "Running", "Done"],
        "10.0.0.1\n10.0.0.2\n10.0.0.3\n",
    );
    let nikto_csv = h.state_dir.join("nikto_combined.csv");
    std::fs::write(&nikto_csv, NIKTO_CSV).unwrap();
    let aux = [AuxScanResult {
        tool: SourceTool::Nikto,
        csv_path: nikto_csv,
    }];
    let exploit = ExploitOutcome {
        exploited: 1,
        incompatible: 2,
        report_file: None,
    };

    let aggregator =
        CampaignAggregator::with_controller(fast_controller(), h.params.clone(), &h.state_dir);
    let (_cancel_tx, mut cancel) = watch::channel(false);
    let (event_tx, mut event_rx) = mpsc::channel(64);
    let summary = aggregator
        .run_campaign(&aux, Some(exploit), &mut cancel, &event_tx)
        .await
        .unwrap();
    drop(event_tx);

    // Counts come from the engine summary, not from row counting.
    assert_eq!(summary.hosts_count, 3);
    assert_eq!(summary.apps_count, 4);
    assert_eq!(summary.os_count, 2);
    assert_eq!(summary.high_count, 2);
    assert_eq!(summary.medium_count, 1);
    assert_eq!(summary.low_count, 0);
    assert_eq!(summary.exploitedcves, Some(1));
    assert_eq!(summary.incompatiblecves, Some(2));

    // The poll loop saw exactly the scripted transitions: two non-terminal
    // answers, then Done.
    assert_eq!(h.state.lock().unwrap().polls, 3);

    // counts.json mirrors the summary.
    let counts = json_file(h.state_dir.join("counts.json"));
    assert_eq!(counts["high_count"], 2);
    assert_eq!(counts["exploitedcves"], 1);

    // Exactly one trend sample, carrying the severity counts.
    let series = json_file(h.state_dir.join("historical_results.json"));
    let series = series.as_array().unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(series[0]["high_count"], 2);
    assert_eq!(series[0]["medium_count"], 1);
    assert_eq!(series[0]["low_count"], 0);

    // Identity maps: 4 OpenVAS plugins + 1 Nikto reference; 5 OpenVAS
    // occurrences + 2 Nikto occurrences.
    let vulns = json_file(h.state_dir.join("vuln_mapping.json"));
    assert_eq!(vulns.as_object().unwrap().len(), 5);
    assert!(vulns.get("OpenVAS:PLUGIN-1").is_some());
    assert!(vulns.get("Nikto:CWE-16").is_some());
    let findings = json_file(h.state_dir.join("finding_mapping.json"));
    assert_eq!(findings.as_object().unwrap().len(), 7);
    // Two occurrences of the same plugin share a MID but not a DID.
    assert_ne!(
        findings["OpenVAS:PLUGIN-1_10.0.0.1_80"],
        findings["OpenVAS:PLUGIN-1_10.0.0.2_80"]
    );

    // The retrieved CSV was rewritten in place with MID/DID columns.
    let csv_report = std::fs::read_dir(&h.params.reports_dir)
        .unwrap()
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .find(|p| p.extension().is_some_and(|ext| ext == "csv"))
        .expect("CSV report on disk");
    let rewritten = std::fs::read_to_string(csv_report).unwrap();
    assert!(rewritten.lines().next().unwrap().ends_with("MID,DID"));
    assert_eq!(rewritten.lines().count(), 6);

    let mut saw_completed = false;
    while let Ok(event) = event_rx.try_recv() {
        if matches!(event, CampaignEvent::Completed(_)) {
            saw_completed = true;
        }
    }
    assert!(saw_completed);
}

#[tokio::test]
async fn target_resolution_is_idempotent_across_runs() {
    let h = setup(&["Done"], "10.0.0.1\n");
    let controller = fast_controller();
    let (_cancel_tx, mut cancel) = watch::channel(false);
    let (event_tx, _event_rx) = mpsc::channel(64);

    controller
        .run_scan(&h.params, &mut cancel, &event_tx)
        .await
        .unwrap();
    controller
        .run_scan(&h.params, &mut cancel, &event_tx)
        .await
        .unwrap();

    let state = h.state.lock().unwrap();
    // One target for the name, but a fresh task per run.
    assert_eq!(state.created_targets, 1);
    assert_eq!(state.created_tasks, 2);
}

#[tokio::test]
async fn pdf_failure_does_not_block_csv_retrieval() {
    let h = setup(&["Done"], "10.0.0.1\n");
    h.state.lock().unwrap().fail_pdf = true;
    let controller = fast_controller();
    let (_cancel_tx, mut cancel) = watch::channel(false);
    let (event_tx, _event_rx) = mpsc::channel(64);

    let outcome = controller
        .run_scan(&h.params, &mut cancel, &event_tx)
        .await
        .unwrap();
    assert!(outcome.pdf_path.is_none());
    assert!(outcome.csv_path.is_some());
    assert_eq!(outcome.high_count, 2);
}

#[tokio::test]
async fn csv_failure_short_circuits_aggregation_without_failing() {
    let h = setup(&["Done"], "10.0.0.1\n");
    h.state.lock().unwrap().fail_csv = true;
    let aggregator =
        CampaignAggregator::with_controller(fast_controller(), h.params.clone(), &h.state_dir);
    let (_cancel_tx, mut cancel) = watch::channel(false);
    let (event_tx, _event_rx) = mpsc::channel(64);

    let summary = aggregator
        .run_campaign(&[], None, &mut cancel, &event_tx)
        .await
        .unwrap();

    // Engine counts survive, but nothing downstream of the CSV ran: no
    // identity maps, no trend sample.
    assert_eq!(summary.high_count, 2);
    assert!(h.state_dir.join("counts.json").exists());
    assert!(!h.state_dir.join("vuln_mapping.json").exists());
    assert!(!h.state_dir.join("historical_results.json").exists());
}

#[tokio::test]
async fn stopped_task_returns_without_artifacts() {
    let h = setup(&["Requested", "Stopped"], "10.0.0.1\n");
    let controller = fast_controller();
    let (_cancel_tx, mut cancel) = watch::channel(false);
    let (event_tx, _event_rx) = mpsc::channel(64);

    let outcome = controller
        .run_scan(&h.params, &mut cancel, &event_tx)
        .await
        .unwrap();
    assert_eq!(outcome.status, TaskStatus::Stopped);
    assert!(outcome.csv_path.is_none());
    assert!(outcome.pdf_path.is_none());
    assert_eq!(outcome.high_count, 0);
    // No retrieval happened, so the reports directory was never created.
    assert!(!h.params.reports_dir.exists());
}

#[tokio::test]
async fn unknown_statuses_keep_the_poll_loop_going() {
    let h = setup(
        &["Requested", "Queued", "Stop Requested", "Running", "Done"],
        "10.0.0.1\n",
    );
    let controller = fast_controller();
    let (_cancel_tx, mut cancel) = watch::channel(false);
    let (event_tx, _event_rx) = mpsc::channel(64);

    let outcome = controller
        .run_scan(&h.params, &mut cancel, &event_tx)
        .await
        .unwrap();
    assert_eq!(outcome.status, TaskStatus::Done);
    assert_eq!(h.state.lock().unwrap().polls, 5);
}

#[tokio::test]
async fn cancellation_cuts_the_poll_wait_short() {
    let h = setup(&["Running"], "10.0.0.1\n");
    // A poll interval long enough that only cancellation can end the test.
    let controller = ScanLifecycleController::with_intervals(
        Duration::from_secs(3600),
        Duration::from_millis(1),
    );
    let (cancel_tx, mut cancel) = watch::channel(false);
    let (event_tx, _event_rx) = mpsc::channel(64);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = cancel_tx.send(true);
    });

    let err = controller
        .run_scan(&h.params, &mut cancel, &event_tx)
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::Cancelled));
}
