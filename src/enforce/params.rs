//! Per-action parameter schemas and expiration.
//!
//! Each action type owns one pure function that validates its parameter
//! shape and computes the expiry from "now". There is no fallback arm:
//! anything that is not a known [`ActionType`] is rejected before it gets
//! here.
//!
//! | action           | params                               | expiry                      |
//! |------------------|--------------------------------------|-----------------------------|
//! | `LOCK_USER_TEMP` | `durationMinutes` (default 10)       | now + durationMinutes       |
//! | `RATE_LIMIT`     | `durationHours` (default 1), `scope` | now + durationHours         |
//! | `REQUIRE_REAUTH` | none                                 | now + 1 hour                |

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use super::{ActionScope, ActionType, EnforceError};

pub const DEFAULT_LOCK_MINUTES: f64 = 10.0;
pub const DEFAULT_RATE_LIMIT_HOURS: f64 = 1.0;
pub const REAUTH_HOURS: i64 = 1;

/// Upper bounds; anything longer is an operator mistake, not a countermeasure.
pub const MAX_LOCK_MINUTES: f64 = 30.0 * 24.0 * 60.0;
pub const MAX_RATE_LIMIT_HOURS: f64 = 30.0 * 24.0;

/// Outcome of validating an action's parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAction {
    pub expires_at: DateTime<Utc>,
    /// Scope named by the parameters, if any.
    pub scope: Option<ActionScope>,
}

/// Validate `params` for `action` and compute the expiry relative to `now`.
pub fn resolve(action: ActionType, params: &Value, now: DateTime<Utc>) -> Result<ResolvedAction, EnforceError> {
    if !(params.is_object() || params.is_null()) {
        return Err(invalid(action, "parameters must be a JSON object"));
    }
    match action {
        ActionType::LockUserTemp => lock_user_temp(params, now),
        ActionType::RateLimit => rate_limit(params, now),
        ActionType::RequireReauth => require_reauth(now),
    }
}

/// Validate parameters without computing anything, for policy administration.
pub fn validate(action: ActionType, params: &Value) -> Result<(), EnforceError> {
    resolve(action, params, Utc::now()).map(|_| ())
}

fn lock_user_temp(params: &Value, now: DateTime<Utc>) -> Result<ResolvedAction, EnforceError> {
    let action = ActionType::LockUserTemp;
    let minutes = bounded_number(params, "durationMinutes", MAX_LOCK_MINUTES, action)?
        .unwrap_or(DEFAULT_LOCK_MINUTES);
    Ok(ResolvedAction {
        expires_at: now + Duration::milliseconds((minutes * 60_000.0).round() as i64),
        scope: None,
    })
}

fn rate_limit(params: &Value, now: DateTime<Utc>) -> Result<ResolvedAction, EnforceError> {
    let action = ActionType::RateLimit;
    let hours = bounded_number(params, "durationHours", MAX_RATE_LIMIT_HOURS, action)?
        .unwrap_or(DEFAULT_RATE_LIMIT_HOURS);

    let scope = match params.get("scope") {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) => Some(
            raw.parse::<ActionScope>()
                .map_err(|e| invalid(action, &e.to_string()))?,
        ),
        Some(_) => return Err(invalid(action, "scope must be a string")),
    };

    Ok(ResolvedAction {
        expires_at: now + Duration::milliseconds((hours * 3_600_000.0).round() as i64),
        scope,
    })
}

fn require_reauth(now: DateTime<Utc>) -> Result<ResolvedAction, EnforceError> {
    Ok(ResolvedAction {
        expires_at: now + Duration::hours(REAUTH_HOURS),
        scope: None,
    })
}

/// Read an optional positive number no larger than `max`.
fn bounded_number(params: &Value, key: &str, max: f64, action: ActionType) -> Result<Option<f64>, EnforceError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            let value = n
                .as_f64()
                .filter(|v| v.is_finite())
                .ok_or_else(|| invalid(action, &format!("{key} is not a finite number")))?;
            if value <= 0.0 {
                return Err(invalid(action, &format!("{key} must be positive")));
            }
            if value > max {
                return Err(invalid(action, &format!("{key} must not exceed {max}")));
            }
            Ok(Some(value))
        }
        Some(_) => Err(invalid(action, &format!("{key} must be a number"))),
    }
}

fn invalid(action: ActionType, reason: &str) -> EnforceError {
    EnforceError::InvalidParams {
        action,
        reason: reason.to_string(),
    }
}
