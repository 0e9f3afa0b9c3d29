use crate::ipc::error::err;
use chrono::{NaiveDate, NaiveTime};
use serde_json::json;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: "not_found",
            message: message.into(),
            details: None,
        }
    }

    pub fn db(code: &'static str, e: impl ToString) -> Self {
        Self {
            code,
            message: e.to_string(),
            details: None,
        }
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Optional string param; blank and null both read as absent.
pub fn get_opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn parse_date_param(params: &serde_json::Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = get_required_str(params, key)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|_| {
        let mut e = HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key));
        e.details = Some(json!({ "value": raw }));
        e
    })
}

/// Validates HH:MM and returns it in canonical zero-padded form.
pub fn parse_time_param(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let raw = get_required_str(params, key)?;
    let t = NaiveTime::parse_from_str(&raw, "%H:%M").map_err(|_| {
        let mut e = HandlerErr::bad_params(format!("{} must be HH:MM", key));
        e.details = Some(json!({ "value": raw }));
        e
    })?;
    Ok(t.format("%H:%M").to_string())
}

pub fn parse_positive_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    let v = params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if v <= 0 {
        return Err(HandlerErr::bad_params(format!("{} must be > 0", key)));
    }
    Ok(v)
}

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub fn now_stamp() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}
