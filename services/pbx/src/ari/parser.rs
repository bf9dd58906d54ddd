//! Normalizes a raw ARI event payload into a [`ParsedEvent`] (spec.md §4.1).
//!
//! Grounded on `app/ari/parser.py`: the dial-plan fallback splits
//! `channel.dialplan.app_data` on commas the same way, trimming whitespace
//! and dropping empty segments. This version additionally prefers the
//! event's own `application`/`args` fields when present, per spec.md's
//! fuller description of the rule (the original only ever saw the
//! dial-plan form since nothing in its deployment set those fields).

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEvent {
    pub etype: String,
    pub timestamp: Option<String>,
    pub channel_id: Option<String>,
    pub channel_name: Option<String>,
    pub app_name: Option<String>,
    pub app_args: Vec<String>,
    pub raw: Value,
}

fn split_app_data(app_data: Option<&str>) -> (Option<String>, Vec<String>) {
    let Some(app_data) = app_data else {
        return (None, Vec::new());
    };

    let parts: Vec<String> = app_data
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();

    match parts.split_first() {
        Some((app_name, args)) => (Some(app_name.clone()), args.to_vec()),
        None => (None, Vec::new()),
    }
}

/// Parse a raw JSON ARI event. Never fails: malformed or unrecognized
/// payloads simply produce a [`ParsedEvent`] with an empty `etype`, which
/// the call service treats as a no-op.
pub fn parse_event(raw: Value) -> ParsedEvent {
    let etype = raw
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let timestamp = raw
        .get("timestamp")
        .and_then(Value::as_str)
        .map(str::to_string);

    let channel = raw.get("channel");
    let channel_id = channel
        .and_then(|c| c.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let channel_name = channel
        .and_then(|c| c.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let event_application = raw.get("application").and_then(Value::as_str);
    let event_args: Option<Vec<String>> = raw.get("args").and_then(Value::as_array).map(|arr| {
        arr.iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    });

    let (app_name, app_args) = match event_application {
        Some(app) if !app.is_empty() => (Some(app.to_string()), event_args.unwrap_or_default()),
        _ => {
            let app_data = channel
                .and_then(|c| c.get("dialplan"))
                .and_then(|d| d.get("app_data"))
                .and_then(Value::as_str);
            split_app_data(app_data)
        }
    };

    ParsedEvent {
        etype,
        timestamp,
        channel_id,
        channel_name,
        app_name,
        app_args,
        raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn falls_back_to_dialplan_app_data() {
        let ev = parse_event(json!({
            "type": "StasisStart",
            "timestamp": "2024-01-01T00:00:00.000+0000",
            "channel": {
                "id": "C-A",
                "name": "PJSIP/1000-00000001",
                "dialplan": { "app_data": "pbx_ari, 1001 " }
            }
        }));

        assert_eq!(ev.etype, "StasisStart");
        assert_eq!(ev.channel_id.as_deref(), Some("C-A"));
        assert_eq!(ev.channel_name.as_deref(), Some("PJSIP/1000-00000001"));
        assert_eq!(ev.app_name.as_deref(), Some("pbx_ari"));
        assert_eq!(ev.app_args, vec!["1001".to_string()]);
    }

    #[test]
    fn prefers_event_level_application_and_args() {
        let ev = parse_event(json!({
            "type": "StasisStart",
            "application": "pbx_ari",
            "args": ["callee", "1001"],
            "channel": { "id": "C-B", "name": "PJSIP/1001-00000002" }
        }));

        assert_eq!(ev.app_name.as_deref(), Some("pbx_ari"));
        assert_eq!(ev.app_args, vec!["callee".to_string(), "1001".to_string()]);
    }

    #[test]
    fn empty_app_data_yields_no_args() {
        let ev = parse_event(json!({
            "type": "StasisStart",
            "channel": { "id": "C-A", "dialplan": { "app_data": "" } }
        }));

        assert_eq!(ev.app_name, None);
        assert!(ev.app_args.is_empty());
    }

    #[test]
    fn malformed_payload_yields_empty_etype() {
        let ev = parse_event(json!({ "unexpected": true }));
        assert_eq!(ev.etype, "");
        assert_eq!(ev.channel_id, None);
    }

    #[test]
    fn missing_channel_name_is_tolerated() {
        let ev = parse_event(json!({
            "type": "ChannelDestroyed",
            "channel": { "id": "C-A" }
        }));
        assert_eq!(ev.channel_id.as_deref(), Some("C-A"));
        assert_eq!(ev.channel_name, None);
    }
}
