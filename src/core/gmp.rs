// src/core/gmp.rs

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, info};

use crate::core::error::{Result, ScanError};
use crate::core::models::TaskStatus;

/// Well-known report format identifiers of the management protocol. Fixed by
/// the service, not user-configurable.
pub const XML_REPORT_FORMAT_ID: &str = "a994b278-1f62-11e1-96ac-406186ea4fc5";
pub const PDF_REPORT_FORMAT_ID: &str = "c402cc3e-b531-11e1-9163-406186ea4fc5";
pub const CSV_REPORT_FORMAT_ID: &str = "c1645568-627a-11e3-a660-406186ea4fc5";

/// A target as listed by the remote service.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub id: String,
    pub name: String,
}

/// Counts extracted from the XML summary report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportCounts {
    pub hosts: u32,
    pub os: u32,
    pub apps: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

/// Client for the GMP-style management protocol: one XML element per command,
/// one XML element per response, over a Unix-domain socket.
///
/// `timeout` bounds every single exchange (and the initial connect). It is
/// sized from the campaign's host count by the caller and is a transport
/// property — a scan that legitimately runs for hours is fine as long as each
/// individual exchange answers within the window.
pub struct GmpClient {
    stream: UnixStream,
    timeout: Duration,
}

impl GmpClient {
    pub async fn connect(socket_path: &Path, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(socket_path))
            .await
            .map_err(|_| ScanError::TransportTimeout {
                operation: "connect",
                seconds: timeout.as_secs(),
            })?
            .map_err(|source| ScanError::Transport {
                operation: "connect",
                source,
            })?;
        debug!(path = %socket_path.display(), "connected to scan service socket");
        Ok(Self { stream, timeout })
    }

    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        let command = format!(
            "<authenticate><credentials><username>{}</username><password>{}</password></credentials></authenticate>",
            escape(username),
            escape(password)
        );
        let raw = self.exchange("authenticate", &command).await?;
        let response: StatusOnly = parse_response("authenticate", &raw)?;
        if !response.status.starts_with('2') {
            return Err(ScanError::Authentication(
                response
                    .status_text
                    .unwrap_or_else(|| format!("status {}", response.status)),
            ));
        }
        info!("authenticated with the scan service");
        Ok(())
    }

    pub async fn get_targets(&mut self) -> Result<Vec<RemoteTarget>> {
        let raw = self.exchange("get_targets", "<get_targets/>").await?;
        let response: GetTargetsResponse = parse_response("get_targets", &raw)?;
        ensure_ok("get_targets", &response.status, response.status_text.as_deref())?;
        Ok(response
            .targets
            .into_iter()
            .map(|t| RemoteTarget { id: t.id, name: t.name })
            .collect())
    }

    pub async fn create_target(
        &mut self,
        name: &str,
        hosts: &str,
        port_list_id: &str,
    ) -> Result<String> {
        let command = format!(
            "<create_target><name>{}</name><hosts>{}</hosts><port_list id=\"{}\"/></create_target>",
            escape(name),
            escape(hosts),
            escape(port_list_id)
        );
        let raw = self.exchange("create_target", &command).await?;
        let response: CreateResponse = parse_response("create_target", &raw)?;
        ensure_ok("create_target", &response.status, response.status_text.as_deref())?;
        response.id.ok_or_else(|| ScanError::Protocol {
            command: "create_target",
            message: "response carried no target id".to_string(),
        })
    }

    pub async fn create_task(
        &mut self,
        name: &str,
        config_id: &str,
        target_id: &str,
        scanner_id: &str,
    ) -> Result<String> {
        let command = format!(
            "<create_task><name>{}</name><config id=\"{}\"/><target id=\"{}\"/><scanner id=\"{}\"/></create_task>",
            escape(name),
            escape(config_id),
            escape(target_id),
            escape(scanner_id)
        );
        let raw = self.exchange("create_task", &command).await?;
        let response: CreateResponse = parse_response("create_task", &raw)?;
        ensure_ok("create_task", &response.status, response.status_text.as_deref())?;
        response.id.ok_or_else(|| ScanError::Protocol {
            command: "create_task",
            message: "response carried no task id".to_string(),
        })
    }

    /// Start the task. The response carries the identifier of the report the
    /// scan will write into.
    pub async fn start_task(&mut self, task_id: &str) -> Result<String> {
        let command = format!("<start_task task_id=\"{}\"/>", escape(task_id));
        let raw = self.exchange("start_task", &command).await?;
        let response: StartTaskResponse = parse_response("start_task", &raw)?;
        ensure_ok("start_task", &response.status, response.status_text.as_deref())?;
        response.report_id.ok_or_else(|| ScanError::Protocol {
            command: "start_task",
            message: "response carried no report id".to_string(),
        })
    }

    pub async fn task_status(&mut self, task_id: &str) -> Result<TaskStatus> {
        let command = format!("<get_tasks task_id=\"{}\"/>", escape(task_id));
        let raw = self.exchange("get_tasks", &command).await?;
        let response: GetTasksResponse = parse_response("get_tasks", &raw)?;
        ensure_ok("get_tasks", &response.status, response.status_text.as_deref())?;
        let status = response
            .task
            .and_then(|t| t.status)
            .ok_or_else(|| ScanError::Protocol {
                command: "get_tasks",
                message: "response carried no task status".to_string(),
            })?;
        Ok(status
            .parse()
            .unwrap_or_else(|_| TaskStatus::Other(status.clone())))
    }

    /// Fetch one report rendition. Returns the raw response document; callers
    /// pick it apart with `summary_counts` or `report_payload`.
    pub async fn get_report(&mut self, report_id: &str, format_id: &str) -> Result<String> {
        let command = format!(
            "<get_reports report_id=\"{}\" format_id=\"{}\" ignore_pagination=\"1\" details=\"1\"/>",
            escape(report_id),
            escape(format_id)
        );
        let raw = self.exchange("get_reports", &command).await?;
        let response: StatusOnly = parse_response("get_reports", &raw)?;
        ensure_ok("get_reports", &response.status, response.status_text.as_deref())?;
        Ok(raw)
    }

    /// One command/response round trip with the exchange timeout applied.
    async fn exchange(&mut self, operation: &'static str, command: &str) -> Result<String> {
        let deadline = self.timeout;
        let io = async {
            self.stream.write_all(command.as_bytes()).await?;
            self.stream.flush().await?;
            let mut buf = Vec::with_capacity(8192);
            loop {
                let n = self.stream.read_buf(&mut buf).await?;
                if xml_complete(&buf) {
                    break;
                }
                if n == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "scan service closed the connection mid-response",
                    ));
                }
            }
            Ok(buf)
        };
        let raw = match tokio::time::timeout(deadline, io).await {
            Ok(Ok(buf)) => buf,
            Ok(Err(source)) => return Err(ScanError::Transport { operation, source }),
            Err(_) => {
                return Err(ScanError::TransportTimeout {
                    operation,
                    seconds: deadline.as_secs(),
                });
            }
        };
        String::from_utf8(raw).map_err(|_| ScanError::Protocol {
            command: operation,
            message: "response was not valid UTF-8".to_string(),
        })
    }
}

/// True once `buf` holds one complete XML element (the response root has
/// closed). The protocol has no length framing; this is the read-loop
/// terminator.
pub fn xml_complete(buf: &[u8]) -> bool {
    let mut reader = quick_xml::Reader::from_reader(buf);
    let mut scratch = Vec::new();
    let mut depth = 0usize;
    loop {
        match reader.read_event_into(&mut scratch) {
            Ok(Event::Start(_)) => depth += 1,
            Ok(Event::End(_)) => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return true;
                }
            }
            Ok(Event::Empty(_)) => {
                if depth == 0 {
                    return true;
                }
            }
            Ok(Event::Eof) => return false,
            Err(_) => return false,
            _ => {}
        }
        scratch.clear();
    }
}

/// Pull the host/os/app counts and the severity tally out of the XML summary
/// report. The tally walks every `original_threat` element and counts only
/// High/Medium/Low labels; anything else (`Log`, empty, unknown) is left out.
pub fn summary_counts(xml: &str) -> Result<ReportCounts> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut stack: Vec<String> = Vec::new();
    let mut hosts: Option<u32> = None;
    let mut os: Option<u32> = None;
    let mut apps: Option<u32> = None;
    let (mut high, mut medium, mut low) = (0u32, 0u32, 0u32);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                stack.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().unwrap_or_default();
                let text = text.trim();
                match stack.as_slice() {
                    [.., parent, leaf] if leaf.as_str() == "count" => {
                        let value = text.parse::<u32>().ok();
                        match parent.as_str() {
                            "hosts" if hosts.is_none() => hosts = value,
                            "os" if os.is_none() => os = value,
                            "apps" if apps.is_none() => apps = value,
                            _ => {}
                        }
                    }
                    [.., leaf] if leaf.as_str() == "original_threat" => match text {
                        "High" => high += 1,
                        "Medium" => medium += 1,
                        "Low" => low += 1,
                        _ => {}
                    },
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(ScanError::Protocol {
                    command: "get_reports",
                    message: format!("summary report is not well-formed: {err}"),
                });
            }
            _ => {}
        }
    }
    match (hosts, os, apps) {
        (Some(hosts), Some(os), Some(apps)) => Ok(ReportCounts {
            hosts,
            os,
            apps,
            high,
            medium,
            low,
        }),
        _ => Err(ScanError::Protocol {
            command: "get_reports",
            message: "summary report is missing host/os/app counts".to_string(),
        }),
    }
}

/// Decode the base64 payload of a PDF/CSV report response. The payload is the
/// text that follows the nested `report_format` element inside the inner
/// `report` element.
pub fn report_payload(xml: &str) -> Result<Vec<u8>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut capturing = false;
    let mut encoded = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"report_format" {
                    capturing = true;
                } else if capturing {
                    break;
                }
            }
            Ok(Event::Empty(e)) => {
                if e.name().as_ref() == b"report_format" {
                    capturing = true;
                }
            }
            Ok(Event::Start(_)) => {
                if capturing {
                    break;
                }
            }
            Ok(Event::Text(t)) => {
                if capturing {
                    encoded.push_str(&t.unescape().unwrap_or_default());
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(ScanError::Protocol {
                    command: "get_reports",
                    message: format!("report response is not well-formed: {err}"),
                });
            }
            _ => {}
        }
    }
    let cleaned: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if cleaned.is_empty() {
        return Err(ScanError::Protocol {
            command: "get_reports",
            message: "report response carried no payload".to_string(),
        });
    }
    BASE64.decode(cleaned).map_err(|err| ScanError::Protocol {
        command: "get_reports",
        message: format!("report payload is not valid base64: {err}"),
    })
}

fn ensure_ok(command: &'static str, status: &str, status_text: Option<&str>) -> Result<()> {
    if status.starts_with('2') {
        Ok(())
    } else {
        Err(ScanError::Protocol {
            command,
            message: format!("status {status}: {}", status_text.unwrap_or("no detail")),
        })
    }
}

fn parse_response<T: serde::de::DeserializeOwned>(command: &'static str, raw: &str) -> Result<T> {
    quick_xml::de::from_str(raw).map_err(|err| ScanError::Protocol {
        command,
        message: err.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct StatusOnly {
    #[serde(rename = "@status")]
    status: String,
    #[serde(rename = "@status_text")]
    status_text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetTargetsResponse {
    #[serde(rename = "@status")]
    status: String,
    #[serde(rename = "@status_text")]
    status_text: Option<String>,
    #[serde(rename = "target", default)]
    targets: Vec<TargetElement>,
}

#[derive(Debug, Deserialize)]
struct TargetElement {
    #[serde(rename = "@id")]
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(rename = "@status")]
    status: String,
    #[serde(rename = "@status_text")]
    status_text: Option<String>,
    #[serde(rename = "@id")]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StartTaskResponse {
    #[serde(rename = "@status")]
    status: String,
    #[serde(rename = "@status_text")]
    status_text: Option<String>,
    report_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetTasksResponse {
    #[serde(rename = "@status")]
    status: String,
    #[serde(rename = "@status_text")]
    status_text: Option<String>,
    task: Option<TaskElement>,
}

#[derive(Debug, Deserialize)]
struct TaskElement {
    status: Option<String>,
}
