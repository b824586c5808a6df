//! Chat commands and the ping auto-reply.

use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotCommand {
    Info,
    Test,
    Ping,
}

impl BotCommand {
    /// Whole-message, case-insensitive match. Surrounding whitespace is part
    /// of the message, so `" !info "` is not a command.
    pub fn parse(body: &str) -> Option<Self> {
        match body.to_lowercase().as_str() {
            "!info" => Some(BotCommand::Info),
            "!test" => Some(BotCommand::Test),
            "!ping" => Some(BotCommand::Ping),
            _ => None,
        }
    }
}

/// How a reply goes out: straight to the client, or through the paced
/// send pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Direct,
    Paced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotReply {
    pub text: String,
    pub delivery: Delivery,
}

/// What a command reply may mention about the device.
#[derive(Debug, Clone, Default)]
pub struct DeviceSummary {
    pub device_id: String,
    pub device_name: String,
    pub number: Option<String>,
    pub battery: Option<u8>,
    pub webhook_active: bool,
}

pub fn reply_for(command: BotCommand, device: &DeviceSummary) -> BotReply {
    match command {
        BotCommand::Info => {
            let mut text = String::from("🤖 Device Info:\n");
            let _ = writeln!(text, "📱 Device ID: {}", device.device_id);
            let _ = writeln!(text, "📋 Device Name: {}", device.device_name);
            let _ = writeln!(text, "📞 Number: {}", device.number.as_deref().unwrap_or("unknown"));
            match device.battery {
                Some(level) => {
                    let _ = writeln!(text, "🔋 Battery: {}%", level);
                }
                None => text.push_str("🔋 Battery: unknown\n"),
            }
            text.push_str("📡 Status: Connected\n");
            let _ = write!(
                text,
                "🔗 Webhook: {}",
                if device.webhook_active { "Active" } else { "Not Set" }
            );
            BotReply {
                text,
                delivery: Delivery::Direct,
            }
        }
        BotCommand::Test => BotReply {
            text: format!("🤖 [{}] Test successful!", device.device_name),
            delivery: Delivery::Direct,
        },
        BotCommand::Ping => BotReply {
            text: format!("🏓 [{}] Pong!", device.device_name),
            delivery: Delivery::Paced,
        },
    }
}

/// Auto-reply fires on any message containing "ping", case-insensitively.
pub fn auto_reply_for(enabled: bool, body: &str, device: &DeviceSummary) -> Option<BotReply> {
    if !enabled || !body.to_lowercase().contains("ping") {
        return None;
    }
    Some(BotReply {
        text: format!(
            "🤖 [{}] Pong! Auto reply from device {}",
            device.device_name, device.device_id
        ),
        delivery: Delivery::Direct,
    })
}
