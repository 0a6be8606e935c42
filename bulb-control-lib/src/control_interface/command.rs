use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::control_interface::Bulb;
use crate::error::{BulbError, Result};
use crate::util::codec::Response;

/// Methods understood by the bulb firmware.
///
/// The serialized name is the wire name, e.g. [`Method::SetCtAbx`] is sent as
/// `set_ct_abx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    GetProp,
    SetCtAbx,
    SetRgb,
    SetHsv,
    SetBright,
    SetPower,
    Toggle,
    SetDefault,
    StartCf,
    StopCf,
    SetScene,
    CronAdd,
    CronGet,
    CronDel,
    SetAdjust,
    SetMusic,
    SetName,
    AdjustBright,
    AdjustCt,
    AdjustColor,
    BgSetRgb,
    BgSetHsv,
    BgSetCtAbx,
    BgStartCf,
    BgStopCf,
    BgSetScene,
    BgSetDefault,
    BgSetPower,
    BgSetBright,
    BgSetAdjust,
    BgToggle,
    DevToggle,
    BgAdjustBright,
    BgAdjustCt,
    BgAdjustColor,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GetProp => "get_prop",
            Method::SetCtAbx => "set_ct_abx",
            Method::SetRgb => "set_rgb",
            Method::SetHsv => "set_hsv",
            Method::SetBright => "set_bright",
            Method::SetPower => "set_power",
            Method::Toggle => "toggle",
            Method::SetDefault => "set_default",
            Method::StartCf => "start_cf",
            Method::StopCf => "stop_cf",
            Method::SetScene => "set_scene",
            Method::CronAdd => "cron_add",
            Method::CronGet => "cron_get",
            Method::CronDel => "cron_del",
            Method::SetAdjust => "set_adjust",
            Method::SetMusic => "set_music",
            Method::SetName => "set_name",
            Method::AdjustBright => "adjust_bright",
            Method::AdjustCt => "adjust_ct",
            Method::AdjustColor => "adjust_color",
            Method::BgSetRgb => "bg_set_rgb",
            Method::BgSetHsv => "bg_set_hsv",
            Method::BgSetCtAbx => "bg_set_ct_abx",
            Method::BgStartCf => "bg_start_cf",
            Method::BgStopCf => "bg_stop_cf",
            Method::BgSetScene => "bg_set_scene",
            Method::BgSetDefault => "bg_set_default",
            Method::BgSetPower => "bg_set_power",
            Method::BgSetBright => "bg_set_bright",
            Method::BgSetAdjust => "bg_set_adjust",
            Method::BgToggle => "bg_toggle",
            Method::DevToggle => "dev_toggle",
            Method::BgAdjustBright => "bg_adjust_bright",
            Method::BgAdjustCt => "bg_adjust_ct",
            Method::BgAdjustColor => "bg_adjust_color",
        }
    }
}

impl FromStr for Method {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.trim().to_lowercase()))
            .map_err(|_| anyhow!("Unknown method: {}", s))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What gets written on the wire for one command, minus the correlation id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payload {
    pub method: Method,
    pub params: Vec<Value>,
}

impl Payload {
    /// Builds a payload, rejecting parameter lists the device would refuse.
    pub fn new(method: Method, params: Vec<Value>) -> Result<Self> {
        let needs_params = !matches!(
            method,
            Method::Toggle
                | Method::BgToggle
                | Method::DevToggle
                | Method::SetDefault
                | Method::BgSetDefault
                | Method::StopCf
                | Method::BgStopCf
        );
        if needs_params && params.is_empty() {
            return Err(BulbError::Configuration(format!(
                "{} requires at least one parameter",
                method
            )));
        }
        if let Some(nested) = params.iter().find(|p| p.is_object()) {
            return Err(BulbError::Configuration(format!(
                "{} parameters must be scalars or lists, got {}",
                method, nested
            )));
        }
        Ok(Payload { method, params })
    }

    /// `get_prop` for the given property names.
    pub fn get_prop<S: AsRef<str>>(props: &[S]) -> Result<Self> {
        Payload::new(
            Method::GetProp,
            props
                .iter()
                .map(|p| Value::String(p.as_ref().to_string()))
                .collect(),
        )
    }
}

/// Called once with the device and its reply to the command.
pub type ResponseCallback = Box<dyn FnOnce(&Bulb, &Response) + Send + 'static>;

/// A command travelling through a queue and then a connection's pending map.
pub struct Command {
    pub id: u32,
    pub payload: Payload,
    callback: Option<ResponseCallback>,
    pub enqueued_at: Instant,
}

impl Command {
    pub fn new(id: u32, payload: Payload, callback: Option<ResponseCallback>) -> Self {
        Command {
            id,
            payload,
            callback,
            enqueued_at: Instant::now(),
        }
    }

    pub(crate) fn with_enqueued_at(mut self, at: Instant) -> Self {
        self.enqueued_at = at;
        self
    }

    /// Consumes the command, handing the response to its callback if one was set.
    pub(crate) fn complete(self, bulb: &Bulb, response: &Response) {
        if let Some(callback) = self.callback {
            callback(bulb, response);
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("payload", &self.payload)
            .field("has_callback", &self.callback.is_some())
            .field("enqueued_at", &self.enqueued_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_method_wire_names_round_trip_through_from_str() {
        for name in ["set_ct_abx", "bg_set_rgb", "dev_toggle", "get_prop"] {
            let method: Method = name.parse().unwrap();
            assert_eq!(method.as_str(), name);
            assert_eq!(serde_json::to_value(method).unwrap(), json!(name));
        }
        assert!("set_waveform".parse::<Method>().is_err());
    }

    #[test]
    fn test_payload_requires_params_for_setters() {
        assert!(Payload::new(Method::SetRgb, vec![]).is_err());
        assert!(Payload::new(Method::Toggle, vec![]).is_ok());
        assert!(Payload::get_prop::<&str>(&[]).is_err());
    }

    #[test]
    fn test_payload_rejects_object_params() {
        let result = Payload::new(Method::SetScene, vec![json!({"color": 1})]);
        assert!(matches!(result, Err(BulbError::Configuration(_))));
    }
}
