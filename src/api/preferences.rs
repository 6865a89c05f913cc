use axum::{extract::State, Extension, Json};
use std::sync::Arc;

use super::error::ApiError;
use crate::db::{NotificationPreferences, UpdatePreferencesRequest, User};
use crate::notifications::preferences::{self, REMINDER_MINUTES};
use crate::AppState;

/// GET /api/notification-preferences
pub async fn get_preferences(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> Result<Json<NotificationPreferences>, ApiError> {
    Ok(Json(preferences::load(&state.db, &user.id).await?))
}

/// PUT /api/notification-preferences
pub async fn update_preferences(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Json(req): Json<UpdatePreferencesRequest>,
) -> Result<Json<NotificationPreferences>, ApiError> {
    if let Some(minutes) = req.reminder_minutes_before {
        if minutes != 0 && !REMINDER_MINUTES.contains(&minutes) {
            return Err(ApiError::validation_field(
                "reminder_minutes_before",
                format!(
                    "Reminder must be between {} and {} minutes before class",
                    REMINDER_MINUTES.start(),
                    REMINDER_MINUTES.end()
                ),
            ));
        }
    }

    let prefs = preferences::update(&state.db, &user.id, &req).await?;
    tracing::info!(user_id = %user.id, "Notification preferences updated");
    Ok(Json(prefs))
}
