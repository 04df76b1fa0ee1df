use chrono::Utc;
use serde_json::json;
use wabridge_core::phone::normalize_phone;
use wabridge_core::types::Message;

/// Canonical payload POSTed to a tenant's CRM endpoint on inbound message.
/// Numbers are E.164; the text body is lifted out of the structured content.
pub fn build_envelope(message: &Message) -> serde_json::Value {
    let text = message
        .content
        .get("text")
        .and_then(|t| t.as_str())
        .unwrap_or_default();

    let mut data = json!({
        "from": normalize_phone(&message.from_number),
        "to": normalize_phone(&message.to_number),
        "message": text,
        "messageId": message.message_id,
        "messageType": message.message_type,
        "isGroupMessage": message.is_group_message,
    });
    if let Some(group_jid) = &message.group_jid {
        data["groupJid"] = json!(group_jid);
    }

    json!({
        "type": "whatsapp_message",
        "timestamp": Utc::now().to_rfc3339(),
        "data": data,
    })
}
