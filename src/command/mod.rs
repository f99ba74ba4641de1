//! Signed desired-state commands for registered devices: capability-driven
//! payload encoding, request signing against the temporary credentials and
//! dispatch to the message broker.

mod dispatch;
pub mod sign;

pub use dispatch::CommandDispatcher;

use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::directory::Capabilities;
use crate::util::http::NetworkError;

/// Supported temperature range in °C.
const MIN_TEMPERATURE: u8 = 16;
const MAX_TEMPERATURE: u8 = 30;

/// Abstract device controls. Each maps to the vendor field name used in
/// command payloads via [`Control::shortcut`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    Power,
    TargetTemperature,
    FanSpeed,
}

impl Control {
    /// The vendor-specific field name encoding this control on the wire.
    pub fn shortcut(&self) -> &'static str {
        match self {
            Control::Power => "powerSwitch",
            Control::TargetTemperature => "targetTemperature",
            Control::FanSpeed => "windSpeed",
        }
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Control::Power => "power",
            Control::TargetTemperature => "target temperature",
            Control::FanSpeed => "fan speed",
        };
        name.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FanSpeed {
    Auto,
    Low,
    Medium,
    High,
}

impl FanSpeed {
    fn encode(&self) -> u8 {
        match self {
            FanSpeed::Auto => 0,
            FanSpeed::Low => 1,
            FanSpeed::Medium => 2,
            FanSpeed::High => 3,
        }
    }
}

/// The state a caller wants a device to reach. Only the set controls are
/// sent; the device keeps its current value for everything else.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DesiredState {
    power: Option<bool>,
    target_temperature: Option<u8>,
    fan_speed: Option<FanSpeed>,
}

impl DesiredState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn power(mut self, on: bool) -> Self {
        self.power = Some(on);
        self
    }

    pub fn target_temperature(mut self, celsius: u8) -> Self {
        self.target_temperature = Some(celsius);
        self
    }

    pub fn fan_speed(mut self, speed: FanSpeed) -> Self {
        self.fan_speed = Some(speed);
        self
    }

    /// Encodes the set controls through the device's capability shortcuts.
    /// Controls the device never reported are refused rather than silently
    /// dropped.
    pub(crate) fn encode(&self, capabilities: &Capabilities) -> Result<Map<String, Value>, CommandError> {
        let mut fields = Map::new();

        if let Some(on) = self.power {
            if !capabilities.supports(Control::Power) {
                return Err(CommandError::Unsupported(Control::Power));
            }
            fields.insert(
                Control::Power.shortcut().to_string(),
                Value::from(u8::from(on)),
            );
        }

        if let Some(celsius) = self.target_temperature {
            if !capabilities.supports(Control::TargetTemperature) {
                return Err(CommandError::Unsupported(Control::TargetTemperature));
            }
            if !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&celsius) {
                return Err(CommandError::TemperatureOutOfRange(celsius));
            }
            fields.insert(
                Control::TargetTemperature.shortcut().to_string(),
                Value::from(celsius),
            );
        }

        if let Some(speed) = self.fan_speed {
            if !capabilities.supports(Control::FanSpeed) {
                return Err(CommandError::Unsupported(Control::FanSpeed));
            }
            fields.insert(
                Control::FanSpeed.shortcut().to_string(),
                Value::from(speed.encode()),
            );
        }

        if fields.is_empty() {
            return Err(CommandError::Empty);
        }
        Ok(fields)
    }
}

/// A fully encoded command about to be signed and dispatched.
#[derive(Clone, Debug)]
pub struct CommandRequest {
    pub device_id: String,
    pub desired: Map<String, Value>,
    /// Broker-side idempotency nonce.
    pub client_token: String,
    pub issued_at: DateTime<Utc>,
}

impl CommandRequest {
    pub(crate) fn new(device_id: &str, desired: Map<String, Value>) -> Self {
        let issued_at = Utc::now();
        Self {
            device_id: device_id.to_string(),
            desired,
            client_token: format!("mobile_{}", issued_at.timestamp_millis()),
            issued_at,
        }
    }
}

/// Broker verdict for a dispatched command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandErrorKind {
    DeviceOffline,
    Unauthorized,
    Throttled,
    MalformedPayload,
}

/// Outcome of a dispatch: either the broker acknowledged the command, or it
/// rejected it for a reason a retry cannot fix (except `Unauthorized`, which
/// gets exactly one refresh-and-retry before being surfaced).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandResult {
    pub accepted: bool,
    pub error: Option<CommandErrorKind>,
}

impl CommandResult {
    pub(crate) fn accepted() -> Self {
        Self {
            accepted: true,
            error: None,
        }
    }

    pub(crate) fn rejected(kind: CommandErrorKind) -> Self {
        Self {
            accepted: false,
            error: Some(kind),
        }
    }
}

/// Failures producing no broker verdict at all.
#[derive(Debug, Error)]
pub enum CommandError {
    /// No authenticated session and none could be produced within the
    /// configured wait.
    #[error("no usable session")]
    SessionUnavailable,

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("device does not support {0}")]
    Unsupported(Control),

    #[error("target temperature {0}°C outside supported range {MIN_TEMPERATURE}-{MAX_TEMPERATURE}°C")]
    TemperatureOutOfRange(u8),

    #[error("command carries no controls")]
    Empty,

    #[error("request signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Network(#[from] NetworkError),
}
