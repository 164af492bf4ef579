//! Remote Commands Module
//!
//! Translates a requested vehicle action into the telematics command
//! envelope and submits it.

use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use crate::auth::{Session, UserId};
use crate::sync::TelematicsApi;

/// Requested remote action, named after the host service calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Start,
    Stop,
    Lock,
    Unlock,
    /// Horn and/or light flash.
    Hlf,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandKind::Start => write!(f, "start"),
            CommandKind::Stop => write!(f, "stop"),
            CommandKind::Lock => write!(f, "lock"),
            CommandKind::Unlock => write!(f, "unlock"),
            CommandKind::Hlf => write!(f, "hlf"),
        }
    }
}

impl FromStr for CommandKind {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(CommandKind::Start),
            "stop" => Ok(CommandKind::Stop),
            "lock" => Ok(CommandKind::Lock),
            "unlock" => Ok(CommandKind::Unlock),
            "hlf" | "horn-light-flash" => Ok(CommandKind::Hlf),
            other => Err(CommandError::UnknownKind(other.to_string())),
        }
    }
}

/// Horn/light flash mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashMode {
    HornLightFlash,
    LightFlash,
    HornFlash,
}

impl FlashMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlashMode::HornLightFlash => "horn-light-flash",
            FlashMode::LightFlash => "light-flash",
            FlashMode::HornFlash => "horn-flash",
        }
    }
}

impl FromStr for FlashMode {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "horn-light-flash" => Ok(FlashMode::HornLightFlash),
            "light-flash" => Ok(FlashMode::LightFlash),
            "horn-flash" => Ok(FlashMode::HornFlash),
            other => Err(CommandError::InvalidFlashMode(other.to_string())),
        }
    }
}

/// Validated remote action with its parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAction {
    Start,
    Stop,
    Lock,
    /// Unlock window, 1 to 3.
    Unlock(u8),
    Flash(FlashMode),
}

impl CommandAction {
    pub const UNLOCK_WINDOW: std::ops::RangeInclusive<i64> = 1..=3;

    /// Build an action from a kind and its optional raw parameter.
    ///
    /// The unlock window accepts an integer or numeric string and must be
    /// within 1..=3; the flash mode must be one of the known names.
    pub fn from_parts(kind: CommandKind, value: Option<&Value>) -> Result<Self, CommandError> {
        match kind {
            CommandKind::Start => Ok(CommandAction::Start),
            CommandKind::Stop => Ok(CommandAction::Stop),
            CommandKind::Lock => Ok(CommandAction::Lock),
            CommandKind::Unlock => {
                let value = value.ok_or(CommandError::MissingValue(kind))?;
                let window = match value {
                    Value::Number(n) => n.as_i64(),
                    Value::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                }
                .ok_or_else(|| CommandError::InvalidUnlockWindow(value.to_string()))?;
                if !Self::UNLOCK_WINDOW.contains(&window) {
                    return Err(CommandError::InvalidUnlockWindow(window.to_string()));
                }
                Ok(CommandAction::Unlock(window as u8))
            }
            CommandKind::Hlf => {
                let value = value.ok_or(CommandError::MissingValue(kind))?;
                let mode = value
                    .as_str()
                    .ok_or_else(|| CommandError::InvalidFlashMode(value.to_string()))?
                    .parse()?;
                Ok(CommandAction::Flash(mode))
            }
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            CommandAction::Start => CommandKind::Start,
            CommandAction::Stop => CommandKind::Stop,
            CommandAction::Lock => CommandKind::Lock,
            CommandAction::Unlock(_) => CommandKind::Unlock,
            CommandAction::Flash(_) => CommandKind::Hlf,
        }
    }

    /// `(command, serviceId)` pair for the envelope
    fn service(&self) -> (&'static str, &'static str) {
        match self {
            CommandAction::Start => ("start", "RES"),
            CommandAction::Stop => ("stop", "RES"),
            CommandAction::Lock => ("start", "RDL"),
            CommandAction::Unlock(_) => ("start", "RDU"),
            CommandAction::Flash(_) => ("start", "RHL"),
        }
    }

    fn parameters(&self) -> Option<Vec<ServiceParameter>> {
        match self {
            CommandAction::Unlock(window) => Some(vec![ServiceParameter {
                key: "time.window",
                value: Value::from(*window),
            }]),
            CommandAction::Flash(mode) => Some(vec![ServiceParameter {
                key: "rhl",
                value: Value::from(mode.as_str()),
            }]),
            _ => None,
        }
    }
}

/// A command waiting to be sent on the next poll cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub vin: String,
    pub action: CommandAction,
}

impl CommandRequest {
    pub fn new(
        vin: impl Into<String>,
        kind: CommandKind,
        value: Option<&Value>,
    ) -> Result<Self, CommandError> {
        let vin = vin.into();
        if vin.trim().is_empty() {
            return Err(CommandError::EmptyVin);
        }
        Ok(Self {
            vin,
            action: CommandAction::from_parts(kind, value)?,
        })
    }

    /// Build the wire envelope for this request
    pub fn envelope(&self, user_id: &UserId, timestamp: i64) -> CommandEnvelope {
        let (command, service_id) = self.action.service();
        CommandEnvelope {
            command,
            creator: "tc",
            service_id,
            timestamp,
            user_id: user_id.clone(),
            service_parameters: self.action.parameters(),
        }
    }
}

/// JSON body of the telematics command endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub command: &'static str,
    pub creator: &'static str,
    pub service_id: &'static str,
    pub timestamp: i64,
    /// Echoed in the JSON type the login response used.
    pub user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_parameters: Option<Vec<ServiceParameter>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceParameter {
    pub key: &'static str,
    pub value: Value,
}

/// Send a command and report whether the service accepted it.
///
/// Only the HTTP status decides acceptance; the vehicle-side outcome is
/// not awaited.
pub async fn dispatch<A>(api: &A, session: &Session, request: &CommandRequest) -> bool
where
    A: TelematicsApi + ?Sized,
{
    let envelope = request.envelope(&session.user_id, chrono::Utc::now().timestamp());
    info!(
        "Dispatching {} ({}) to {}",
        request.action.kind(),
        envelope.service_id,
        request.vin
    );

    match api.send_command(session, &request.vin, &envelope).await {
        Ok(()) => {
            info!("Command {} accepted for {}", request.action.kind(), request.vin);
            true
        }
        Err(e) => {
            error!("Command {} failed for {}: {}", request.action.kind(), request.vin, e);
            false
        }
    }
}

/// Command request errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    UnknownKind(String),

    #[error("Command {0} requires a value")]
    MissingValue(CommandKind),

    #[error("Unlock window must be an integer between 1 and 3, got {0}")]
    InvalidUnlockWindow(String),

    #[error("Flash mode must be horn-light-flash, light-flash or horn-flash, got {0}")]
    InvalidFlashMode(String),

    #[error("Command target VIN is empty")]
    EmptyVin,
}
