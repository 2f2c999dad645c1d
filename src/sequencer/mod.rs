//! Leakage test sequencing and its persisted state.
//!
//! ```text
//!   start/stop/update ─▶ TestService ──lock──▶ Fsm + TestContext
//!                           │                       │ requests
//!                           │                       ▼
//!                           │                  ControlLink (under the lock)
//!                           │◀── TestEffects ───────┘  (record, transitions)
//!                           │
//!                           └──lock──▶ Persistence ─▶ FlashRegion
//! ```
//!
//! Controller requests reach the [`ControlLink`] before the test lock is
//! released, so a release from an ending run can never land after the
//! engage of the next one.  Lock order is test lock, then control lock.
//!
//! The test lock is never held while flash is written.  Images carry a
//! generation number so a slow writer cannot overwrite a newer image with
//! an older one.

pub mod curve;
pub mod report;

use std::sync::{Mutex, MutexGuard, PoisonError};

use heapless::Vec as HVec;
use log::{debug, info, warn};
use serde::Serialize;

use crate::app::ports::{ControlLink, FlashRegion};
use crate::config::TestConfig;
use crate::control::ControlSnapshot;
use crate::error::{Error, Result};
use crate::fsm::context::{ControlRequest, TestContext, TestInputs};
use crate::fsm::{Fsm, TestState, states};
use crate::persistence::{PersistedState, Persistence};
use crate::sensors::MetricsSnapshot;
use report::{TestMode, TestReport, TestRuntime};

/// What a service call changed, for the caller to report once the test lock
/// is released.
#[must_use]
#[derive(Debug, Default)]
pub struct TestEffects {
    /// Requests already handed to the [`ControlLink`], in order.
    pub requests: HVec<ControlRequest, 4>,
    pub transitions: HVec<(TestState, TestState), 4>,
    pub completed_report: Option<u32>,
    /// Outcome of the flash write triggered by this call, if any.
    pub persisted: Option<Result<()>>,
}

/// Report view for the status surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSnapshot {
    pub report: TestReport,
    /// `true` while the report is still being built.
    pub active: bool,
}

struct Sequencer {
    fsm: Fsm,
    ctx: TestContext,
    generation: u64,
}

impl Sequencer {
    /// Hand queued requests to `link` and collect the rest of the outbox.
    /// Runs with the test lock held.
    fn drain(&mut self, link: &impl ControlLink) -> TestEffects {
        let requests = core::mem::take(&mut self.ctx.requests);
        for &request in &requests {
            link.apply(request);
        }
        TestEffects {
            requests,
            transitions: core::mem::take(&mut self.ctx.transitions),
            completed_report: self.ctx.completed_report.take(),
            persisted: None,
        }
    }

    fn pending_image(&mut self) -> PendingImage {
        self.generation += 1;
        PendingImage {
            generation: self.generation,
            state: PersistedState {
                config: self.ctx.config.clone(),
                history: self.ctx.history.clone(),
                sequence: self.ctx.next_report_id.wrapping_sub(1),
            },
        }
    }
}

struct PendingImage {
    generation: u64,
    state: PersistedState,
}

struct Store<F> {
    persistence: Persistence<F>,
    written_generation: u64,
}

/// Process-wide test sequencer.  Every public call takes the test lock for
/// the duration of one state-machine step.
pub struct TestService<F> {
    seq: Mutex<Sequencer>,
    store: Option<Mutex<Store<F>>>,
}

impl<F: FlashRegion> TestService<F> {
    /// Load persisted state from `flash`.  Unusable geometry disables
    /// persistence; an unreadable image is replaced by defaults and written
    /// back immediately.
    pub fn new(flash: F) -> Self {
        let persistence = match Persistence::new(flash) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("STORE | persistence disabled: {}", e);
                None
            }
        };

        let (state, rewrite) = match persistence.as_ref().map(Persistence::load) {
            Some(Ok(state)) => {
                info!(
                    "STORE | loaded {} report(s), seq={}",
                    state.history.len(),
                    state.sequence
                );
                (state, false)
            }
            Some(Err(e)) => {
                warn!("STORE | load failed ({}), using defaults", e);
                (PersistedState::default(), true)
            }
            None => (PersistedState::default(), false),
        };

        let mut ctx = TestContext::new(state.config.clone());
        ctx.next_report_id = state.next_report_id();
        ctx.history = state.history;
        ctx.runtime.reflect_latest(ctx.history.latest());

        let mut fsm = Fsm::new(states::build_state_table(), TestState::Idle);
        fsm.start(&mut ctx);

        let svc = Self {
            seq: Mutex::new(Sequencer {
                fsm,
                ctx,
                generation: 0,
            }),
            store: persistence.map(|persistence| {
                Mutex::new(Store {
                    persistence,
                    written_generation: 0,
                })
            }),
        };

        if rewrite {
            let image = svc.lock().pending_image();
            if let Err(e) = svc.write(image) {
                warn!("STORE | default image write failed: {}", e);
            }
        }
        svc
    }

    fn lock(&self) -> MutexGuard<'_, Sequencer> {
        self.seq.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write `image` unless a newer one already reached flash.
    fn write(&self, image: PendingImage) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
        if image.generation <= store.written_generation {
            debug!("STORE | skipping stale image gen={}", image.generation);
            return Ok(());
        }
        store.persistence.persist(&image.state)?;
        store.written_generation = image.generation;
        Ok(())
    }

    pub fn storage_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn config(&self) -> TestConfig {
        self.lock().ctx.config.clone()
    }

    /// Validate and apply `config`, then persist it.  Rejected configs
    /// change nothing.
    pub fn set_config(&self, config: &TestConfig) -> Result<()> {
        let normalized = config.validate_and_normalize()?;
        let image = {
            let mut seq = self.lock();
            if seq.ctx.runtime.active {
                return Err(Error::Busy);
            }
            seq.ctx.config = normalized;
            seq.pending_image()
        };
        info!("TEST | config updated");
        self.write(image)
    }

    /// Restore the default config and persist it.  Refused while a test runs.
    pub fn reset_config(&self) -> Result<()> {
        let image = {
            let mut seq = self.lock();
            if seq.ctx.runtime.active {
                return Err(Error::Busy);
            }
            seq.ctx.config = TestConfig::default();
            seq.pending_image()
        };
        info!("TEST | config reset to defaults");
        self.write(image)
    }

    /// Begin a test of `mode`.
    pub fn start(
        &self,
        mode: TestMode,
        now_ms: u32,
        link: &impl ControlLink,
    ) -> Result<TestEffects> {
        let mut seq = self.lock();
        let seq = &mut *seq;
        if seq.ctx.runtime.active {
            return Err(Error::Busy);
        }
        let count = seq.ctx.config.point_count();
        if count == 0 {
            return Err(Error::InvalidState("no pressure points configured"));
        }
        if seq.ctx.config.enforce_iso_9972_rules
            && count < usize::from(seq.ctx.config.min_points_required)
        {
            return Err(Error::InvalidState("fewer points than ISO 9972 minimum"));
        }

        seq.ctx.clear_outbox();
        let id = seq.ctx.next_report_id;
        seq.ctx.next_report_id = id.wrapping_add(1).max(1);
        seq.ctx.inputs.now_ms = now_ms;
        seq.ctx.begin(mode, id, now_ms);
        seq.fsm.force_transition(TestState::Preparing, &mut seq.ctx);
        info!("TEST | start id={} mode={} points={}", id, mode.name(), count);
        Ok(seq.drain(link))
    }

    /// Abort a running test.  No effect when idle.
    pub fn stop(&self, now_ms: u32, link: &impl ControlLink) -> TestEffects {
        let mut seq = self.lock();
        let seq = &mut *seq;
        seq.ctx.clear_outbox();
        if seq.ctx.runtime.active {
            seq.ctx.inputs.now_ms = now_ms;
            seq.fsm.force_transition(TestState::Aborted, &mut seq.ctx);
        }
        seq.drain(link)
    }

    /// One sequencer step on the latest measurements.
    pub fn update(
        &self,
        metrics: &MetricsSnapshot,
        control: &ControlSnapshot,
        now_ms: u32,
        link: &impl ControlLink,
    ) -> TestEffects {
        let (mut effects, image) = {
            let mut seq = self.lock();
            let seq = &mut *seq;
            seq.ctx.clear_outbox();
            if !seq.ctx.runtime.active {
                return TestEffects::default();
            }
            seq.ctx.observe(TestInputs {
                metrics: *metrics,
                output_pwm_percent: control.output_pwm_percent,
                now_ms,
            });
            seq.fsm.tick(&mut seq.ctx);
            let effects = seq.drain(link);
            let image = effects.completed_report.map(|_| seq.pending_image());
            (effects, image)
        };

        if let Some(image) = image {
            effects.persisted = Some(self.write(image));
        }
        effects
    }

    pub fn state(&self) -> TestState {
        self.lock().fsm.current_state()
    }

    pub fn runtime(&self) -> TestRuntime {
        self.lock().ctx.runtime
    }

    pub fn latest_report(&self) -> Option<TestReport> {
        self.lock().ctx.history.latest().cloned()
    }

    /// The report being built while a test runs, else the latest completed
    /// one.
    pub fn report_snapshot(&self) -> Option<ReportSnapshot> {
        let seq = self.lock();
        if seq.ctx.runtime.active {
            return Some(ReportSnapshot {
                report: seq.ctx.report.clone(),
                active: true,
            });
        }
        seq.ctx.history.latest().map(|r| ReportSnapshot {
            report: r.clone(),
            active: false,
        })
    }

    /// Completed reports, newest first.
    pub fn history(&self) -> Vec<TestReport> {
        self.lock().ctx.history.iter().cloned().collect()
    }

    pub fn next_report_id(&self) -> u32 {
        self.lock().ctx.next_report_id
    }
}
