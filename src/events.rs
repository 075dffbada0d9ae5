use crate::error::{HideError, HideResult};
use log::{error, info};
use serde::Serialize;
use std::sync::mpsc::Sender;
use typeshare::typeshare;

#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum AppEvent {
    #[serde(rename_all = "camelCase")]
    ProcessDetected {
        pid: u32,
        name: String,
        executable_path: String,
    },
    #[serde(rename_all = "camelCase")]
    ProcessHidden { pid: u32, name: String },
    ErrorOccurred { message: String },
    NotificationRequested { title: String, message: String },
}

impl AppEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ProcessDetected { .. } => "process-detected",
            Self::ProcessHidden { .. } => "process-hidden",
            Self::ErrorOccurred { .. } => "error-occurred",
            Self::NotificationRequested { .. } => "notification-requested",
        }
    }
}

pub trait EmitAppEvent {
    fn emit_app_event(&self, event: &AppEvent) -> HideResult<()>;
}

impl EmitAppEvent for Sender<AppEvent> {
    fn emit_app_event(&self, event: &AppEvent) -> HideResult<()> {
        self.send(event.clone()).map_err(|_| HideError::EventSinkClosed)
    }
}

/// Writes events to the log. Used by the CLI, which has no front end.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEmitter;

impl EmitAppEvent for LogEmitter {
    fn emit_app_event(&self, event: &AppEvent) -> HideResult<()> {
        match event {
            AppEvent::ErrorOccurred { message } => error!("[events] {}", message),
            AppEvent::NotificationRequested { title, message } => {
                info!("[events] {}: {}", title, message)
            }
            other => info!(
                "[events] {} {}",
                other.event_name(),
                serde_json::to_string(other).unwrap_or_default()
            ),
        }
        Ok(())
    }
}
