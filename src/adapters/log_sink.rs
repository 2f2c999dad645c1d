//! Log-based event sink adapter.
//!
//! Implements [`EventSink`] by writing application events to the logger
//! (UART / USB-CDC in production) as single-line `TAG | key=value` records.

use log::{info, warn};

use crate::app::events::AppEvent;
use crate::app::ports::EventSink;

/// Adapter that logs every [`AppEvent`] to the serial console.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for LogEventSink {
    fn emit(&mut self, event: &AppEvent) {
        match event {
            AppEvent::Started {
                state,
                stored_reports,
                storage_enabled,
            } => {
                info!(
                    "START | state={} reports={} storage={}",
                    state.name(),
                    stored_reports,
                    if *storage_enabled { "on" } else { "off" }
                );
            }
            AppEvent::TestStateChanged { from, to } => {
                info!("TEST | {} -> {}", from.name(), to.name());
            }
            AppEvent::ReportCompleted {
                report_id,
                ach_ref_h1,
                valid,
            } => {
                info!(
                    "TEST | report={} ach_ref={:.2}/h valid={}",
                    report_id, ach_ref_h1, valid
                );
            }
            AppEvent::ControlChanged {
                mode,
                relay_enabled,
                target_pressure_pa,
            } => {
                info!(
                    "CTRL | mode={} relay={} target={:.1}Pa",
                    mode.name(),
                    relay_enabled,
                    target_pressure_pa
                );
            }
            AppEvent::PersistFailed(e) => {
                warn!("STORE | persist failed: {}", e);
            }
            AppEvent::ConfigRejected(e) => {
                warn!("TEST | config rejected: {}", e);
            }
            AppEvent::ZeroOffsetsCaptured { captured } => {
                info!("SENSOR | zero offsets captured={}", captured);
            }
        }
    }
}
