//! Per-service webhook parsing (§4.4 step 3) and protocol handshakes
//! (§4.4 step 1).

use base64::Engine;
use serde_json::Value;
use thiserror::Error;

/// A normalized inbound event, pre-tenant-resolution (§4.4 step 3 output).
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub event_type: String,
    pub event_id: String,
    pub data: Value,
    /// The external workspace/team identifier used for tenant resolution
    /// (§4.4 step 4) — `None` when the service has no such concept (e.g. a
    /// single Gmail notification keyed by email address instead).
    pub external_workspace_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed payload for service '{0}': {1}")]
    Malformed(String, String),
    #[error("missing required field '{0}'")]
    MissingField(String),
}

/// Result of checking for a protocol handshake before normal parsing.
pub enum Handshake {
    /// Not a handshake request — proceed to signature verification + parse.
    None,
    /// Respond immediately with this status and body.
    Respond { status: u16, body: String },
}

/// §4.4 step 1: protocol handshakes precede all other logic.
pub fn check_handshake(service: &str, query: &[(String, String)], body: &Value) -> Handshake {
    match service {
        "fitbit" => {
            if let Some((_, code)) = query.iter().find(|(k, _)| k == "verify") {
                // Caller compares `code` against the configured secret and
                // maps to 204/404; signal presence here.
                return Handshake::Respond {
                    status: 204,
                    body: code.clone(),
                };
            }
            Handshake::None
        }
        "microsoft" => {
            if let Some((_, token)) = query.iter().find(|(k, _)| k == "validationToken") {
                return Handshake::Respond {
                    status: 200,
                    body: token.clone(),
                };
            }
            Handshake::None
        }
        "slack" => {
            if body.get("type").and_then(|v| v.as_str()) == Some("url_verification") {
                let challenge = body.get("challenge").and_then(|v| v.as_str()).unwrap_or("");
                return Handshake::Respond {
                    status: 200,
                    body: challenge.to_string(),
                };
            }
            Handshake::None
        }
        "notion" => {
            if let Some(token) = body.get("verification_token").and_then(|v| v.as_str()) {
                return Handshake::Respond {
                    status: 200,
                    body: token.to_string(),
                };
            }
            Handshake::None
        }
        _ => Handshake::None,
    }
}

pub fn parse(service: &str, body: &Value) -> Result<ParsedEvent, ParseError> {
    match service {
        "slack" => parse_slack(body),
        "github" => parse_github(body),
        "notion" => parse_notion(body),
        "todoist" => parse_todoist(body),
        "fitbit" => parse_fitbit(body),
        "microsoft" => parse_microsoft(body),
        "gmail" => parse_gmail(body),
        other => Err(ParseError::Malformed(other.to_string(), "unknown service".into())),
    }
}

fn parse_slack(body: &Value) -> Result<ParsedEvent, ParseError> {
    let event = body
        .get("event")
        .ok_or_else(|| ParseError::MissingField("event".into()))?;
    let event_type = event
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("message")
        .to_string();
    let event_id = body
        .get("event_id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| event.get("ts").and_then(|v| v.as_str()).map(|s| s.to_string()))
        .ok_or_else(|| ParseError::MissingField("event_id".into()))?;
    let team_id = body.get("team_id").and_then(|v| v.as_str()).map(|s| s.to_string());

    Ok(ParsedEvent {
        event_type,
        event_id,
        data: event.clone(),
        external_workspace_id: team_id,
    })
}

fn parse_github(body: &Value) -> Result<ParsedEvent, ParseError> {
    let event_type = body
        .get("action")
        .and_then(|v| v.as_str())
        .unwrap_or("event")
        .to_string();
    let event_id = body
        .get("delivery")
        .or_else(|| body.get("id"))
        .and_then(|v| v.as_str().map(|s| s.to_string()).or_else(|| v.as_i64().map(|n| n.to_string())))
        .ok_or_else(|| ParseError::MissingField("id".into()))?;
    let workspace = body
        .get("repository")
        .and_then(|r| r.get("full_name"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    Ok(ParsedEvent {
        event_type,
        event_id,
        data: body.clone(),
        external_workspace_id: workspace,
    })
}

fn parse_notion(body: &Value) -> Result<ParsedEvent, ParseError> {
    let event_type = body
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("page.updated")
        .to_string();
    let event_id = body
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ParseError::MissingField("id".into()))?
        .to_string();
    let workspace_id = body
        .get("workspace")
        .and_then(|w| w.get("id"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    Ok(ParsedEvent {
        event_type,
        event_id,
        data: body.clone(),
        external_workspace_id: workspace_id,
    })
}

fn parse_todoist(body: &Value) -> Result<ParsedEvent, ParseError> {
    let event_type = body
        .get("event_name")
        .and_then(|v| v.as_str())
        .unwrap_or("item:added")
        .to_string();
    let event_id = body
        .get("event_data")
        .and_then(|d| d.get("id"))
        .and_then(|v| v.as_str().map(|s| s.to_string()).or_else(|| v.as_i64().map(|n| n.to_string())))
        .ok_or_else(|| ParseError::MissingField("event_data.id".into()))?;
    let user_id = body
        .get("user_id")
        .and_then(|v| v.as_str().map(|s| s.to_string()).or_else(|| v.as_i64().map(|n| n.to_string())));

    Ok(ParsedEvent {
        event_type,
        event_id,
        data: body.get("event_data").cloned().unwrap_or_else(|| body.clone()),
        external_workspace_id: user_id,
    })
}

fn parse_fitbit(body: &Value) -> Result<ParsedEvent, ParseError> {
    // Fitbit delivers a JSON array of notification objects.
    let first = body
        .as_array()
        .and_then(|a| a.first())
        .cloned()
        .unwrap_or_else(|| body.clone());
    let event_type = first
        .get("collectionType")
        .and_then(|v| v.as_str())
        .unwrap_or("notification")
        .to_string();
    let event_id = format!(
        "{}_{}",
        first.get("ownerId").and_then(|v| v.as_str()).unwrap_or("unknown"),
        first.get("date").and_then(|v| v.as_str()).unwrap_or("")
    );
    let owner_id = first.get("ownerId").and_then(|v| v.as_str()).map(|s| s.to_string());

    Ok(ParsedEvent {
        event_type,
        event_id,
        data: first,
        external_workspace_id: owner_id,
    })
}

fn parse_microsoft(body: &Value) -> Result<ParsedEvent, ParseError> {
    let notification = body
        .get("value")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .cloned()
        .ok_or_else(|| ParseError::MissingField("value[0]".into()))?;
    let event_type = notification
        .get("changeType")
        .and_then(|v| v.as_str())
        .unwrap_or("created")
        .to_string();
    let event_id = notification
        .get("subscriptionId")
        .and_then(|v| v.as_str())
        .map(|s| format!("{s}:{}", notification.get("resourceData").and_then(|r| r.get("id")).and_then(|v| v.as_str()).unwrap_or("")))
        .ok_or_else(|| ParseError::MissingField("subscriptionId".into()))?;
    // Microsoft's clientState already equals the internal owner id (§4.4
    // step 4) — surfaced here as the "workspace id" for tenant resolution
    // uniformity even though no lookup against a shared workspace is
    // actually needed for this service.
    let client_state = notification
        .get("clientState")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    Ok(ParsedEvent {
        event_type,
        event_id,
        data: notification,
        external_workspace_id: client_state,
    })
}

/// §4.4 step 6: drop `updated` change_type notifications before they ever
/// reach the queue.
pub fn microsoft_should_propagate(event: &ParsedEvent) -> bool {
    event.event_type != "updated"
}

fn parse_gmail(body: &Value) -> Result<ParsedEvent, ParseError> {
    // Pub/Sub push envelope: {"message": {"data": "<base64 json>", ...}}.
    let encoded = body
        .get("message")
        .and_then(|m| m.get("data"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| ParseError::MissingField("message.data".into()))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| ParseError::Malformed("gmail".into(), e.to_string()))?;
    let inner: Value = serde_json::from_slice(&decoded)
        .map_err(|e| ParseError::Malformed("gmail".into(), e.to_string()))?;

    let history_id = inner
        .get("historyId")
        .and_then(|v| v.as_u64().map(|n| n.to_string()).or_else(|| v.as_str().map(|s| s.to_string())))
        .ok_or_else(|| ParseError::MissingField("historyId".into()))?;
    let email_address = inner
        .get("emailAddress")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    Ok(ParsedEvent {
        event_type: "history".to_string(),
        event_id: history_id,
        data: inner,
        external_workspace_id: email_address,
    })
}
