// SPDX-License-Identifier: Apache-2.0

//! Exactly-once lazy creation of a measurement session
//! `(applicationName, hostName, instanceName)`.

use parking_lot::Mutex;

/// Identity of the running process for reporting purposes. Populated once,
/// possibly upgraded with an instance name supplied by the first monitored
/// request's adapter if configuration didn't provide one.
#[derive(Debug, Clone)]
pub struct MeasurementSession {
    pub application_name: String,
    pub host_name: String,
    pub instance_name: Option<String>,
}

/// Serializes first-time session creation so concurrent first callers don't
/// race to allocate. `parking_lot::Mutex` instead of an atomic/OnceCell
/// because upgrading the instance name after the fact needs a read-modify
/// write under the same lock, not just a one-shot `get_or_init`.
#[derive(Default)]
pub struct SessionBootstrap {
    session: Mutex<Option<MeasurementSession>>,
}

impl SessionBootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session, creating it from `application_name`/`host_name`
    /// on first call. `instance_name` can be `None` — the caller upgrades it
    /// separately via [`Self::upgrade_instance_name`] once an adapter has
    /// supplied one.
    pub fn get_or_create(
        &self,
        application_name: &str,
        host_name: &str,
        instance_name: Option<String>,
    ) -> MeasurementSession {
        let mut guard = self.session.lock();
        guard
            .get_or_insert_with(|| MeasurementSession {
                application_name: application_name.to_string(),
                host_name: host_name.to_string(),
                instance_name,
            })
            .clone()
    }

    /// If the session exists and has no instance name yet, sets one. A
    /// no-op if the session is uninitialized or already has a name — so
    /// callers can call this unconditionally on every request without
    /// re-querying the adapter after the first successful upgrade.
    pub fn upgrade_instance_name(&self, instance_name: String) {
        let mut guard = self.session.lock();
        if let Some(session) = guard.as_mut() {
            if session.instance_name.is_none() {
                session.instance_name = Some(instance_name);
            }
        }
    }

    pub fn current(&self) -> Option<MeasurementSession> {
        self.session.lock().clone()
    }
}
