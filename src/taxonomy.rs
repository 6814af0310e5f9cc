//! Event taxonomy and risk classification
//!
//! Pure lookups over `SecurityEventType`. Both tables are exhaustive
//! `match`es, so adding a variant without deciding its risk and title is a
//! compile error rather than a silent LOW.

use crate::types::{PhiAction, RiskLevel, SecurityEventType};

/// Base risk level for an event type
///
/// Deterministic and side-effect free. Types outside the taxonomy
/// (`SecurityEventType::Other`) resolve to `RiskLevel::Low`.
pub fn classify(event_type: &SecurityEventType) -> RiskLevel {
    use SecurityEventType::*;

    match event_type {
        BreachSuspected | UnauthorizedAccess => RiskLevel::Critical,

        PhiAccess { action, .. } => match action {
            PhiAction::Delete | PhiAction::Export | PhiAction::Download => RiskLevel::High,
            PhiAction::View | PhiAction::Update | PhiAction::Print => RiskLevel::Medium,
            PhiAction::Create => RiskLevel::Low,
        },

        UserDeactivated | RoleChanged | SuspiciousActivity | PermissionDenied => RiskLevel::High,

        LoginFailure | RateLimitExceeded => RiskLevel::Medium,

        LoginSuccess | Logout | SessionStart | SessionEnd | SessionTimeout | FeatureEnabled
        | FeatureDisabled | SystemError | ApiError | Other(_) => RiskLevel::Low,
    }
}

/// Fixed alert title for an event type, if it has one
///
/// Types without a dedicated title get `"Security Event: {type}"` from
/// [`alert_title`].
pub fn fixed_title(event_type: &SecurityEventType) -> Option<&'static str> {
    use SecurityEventType::*;

    match event_type {
        BreachSuspected => Some("Potential Data Breach Detected"),
        UnauthorizedAccess => Some("Unauthorized Access Attempt"),
        SuspiciousActivity => Some("Suspicious Activity Detected"),
        RateLimitExceeded => Some("Rate Limit Exceeded"),
        PermissionDenied => Some("Permission Denied"),
        LoginFailure => Some("Failed Login Attempt"),
        RoleChanged => Some("User Role Changed"),
        UserDeactivated => Some("User Account Deactivated"),
        PhiAccess { action, .. } => match action {
            PhiAction::Delete => Some("PHI Record Deleted"),
            PhiAction::Export => Some("PHI Data Exported"),
            PhiAction::Download => Some("PHI Data Downloaded"),
            PhiAction::View | PhiAction::Create | PhiAction::Update | PhiAction::Print => None,
        },
        LoginSuccess | Logout | SessionStart | SessionEnd | SessionTimeout | FeatureEnabled
        | FeatureDisabled | SystemError | ApiError | Other(_) => None,
    }
}

/// Alert title for an event type
pub fn alert_title(event_type: &SecurityEventType) -> String {
    match fixed_title(event_type) {
        Some(title) => title.to_string(),
        None => format!("Security Event: {}", event_type),
    }
}
