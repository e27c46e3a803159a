//! The local virtualization driver boundary. The driver itself (libvirt) is
//! an external collaborator out of scope; this module only defines the
//! contract the VM controller reconciles against, plus a `virsh`-backed
//! implementation in the same style as the Process Runner's other one-shot
//! external tool calls.

use anyhow::Context;

use crate::error::ReconcileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainLiveness {
    Running,
    NotRunning,
}

pub trait VirtDriver: Send + Sync {
    fn liveness(&self, domain: &str) -> Result<DomainLiveness, ReconcileError>;
    fn create_from_xml(&self, domain: &str, xml: &str) -> Result<(), ReconcileError>;
    fn graceful_shutdown(&self, domain: &str) -> Result<(), ReconcileError>;
    fn destroy(&self, domain: &str) -> Result<(), ReconcileError>;
    /// Live migration with an explicit transport URI forcing the
    /// cluster-network path (spec §4.2 send_migrate).
    fn migrate_live(&self, domain: &str, target_uri: &str) -> Result<(), ReconcileError>;
}

pub struct VirshDriver;

impl VirshDriver {
    fn run(&self, args: &[&str]) -> Result<pvcd_sys::CommandOutput, ReconcileError> {
        pvcd_sys::run_foreground("virsh", args)
            .context("failed to invoke virsh")
            .map_err(ReconcileError::Driver)
    }
}

impl VirtDriver for VirshDriver {
    fn liveness(&self, domain: &str) -> Result<DomainLiveness, ReconcileError> {
        let output = self.run(&["domstate", domain])?;
        if output.success() && output.stdout.trim() == "running" {
            Ok(DomainLiveness::Running)
        } else {
            Ok(DomainLiveness::NotRunning)
        }
    }

    fn create_from_xml(&self, _domain: &str, xml: &str) -> Result<(), ReconcileError> {
        let tmp = std::env::temp_dir().join(format!("pvcd-domain-{}.xml", uuid::Uuid::new_v4()));
        std::fs::write(&tmp, xml)
            .context("failed to write domain XML to a temp file")
            .map_err(ReconcileError::Driver)?;
        let path = tmp.to_string_lossy().into_owned();
        let result = self.run(&["create", &path]);
        let _ = std::fs::remove_file(&tmp);
        result.and_then(|out| {
            out.into_result()
                .map(|_| ())
                .map_err(ReconcileError::Driver)
        })
    }

    fn graceful_shutdown(&self, domain: &str) -> Result<(), ReconcileError> {
        self.run(&["shutdown", domain])
            .and_then(|out| out.into_result().map(|_| ()).map_err(ReconcileError::Driver))
    }

    fn destroy(&self, domain: &str) -> Result<(), ReconcileError> {
        self.run(&["destroy", domain])
            .and_then(|out| out.into_result().map(|_| ()).map_err(ReconcileError::Driver))
    }

    fn migrate_live(&self, domain: &str, target_uri: &str) -> Result<(), ReconcileError> {
        self.run(&["migrate", "--live", domain, target_uri])
            .and_then(|out| out.into_result().map(|_| ()).map_err(ReconcileError::Driver))
    }
}

#[cfg(test)]
pub mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct FakeDriver {
        running: Mutex<HashMap<String, bool>>,
        pub fail_migrate: Mutex<bool>,
    }

    impl FakeDriver {
        pub fn set_running(&self, domain: &str, running: bool) {
            self.running.lock().unwrap().insert(domain.to_string(), running);
        }
    }

    impl VirtDriver for FakeDriver {
        fn liveness(&self, domain: &str) -> Result<DomainLiveness, ReconcileError> {
            let running = self.running.lock().unwrap().get(domain).copied().unwrap_or(false);
            Ok(if running {
                DomainLiveness::Running
            } else {
                DomainLiveness::NotRunning
            })
        }

        fn create_from_xml(&self, domain: &str, _xml: &str) -> Result<(), ReconcileError> {
            self.set_running(domain, true);
            Ok(())
        }

        fn graceful_shutdown(&self, domain: &str) -> Result<(), ReconcileError> {
            self.set_running(domain, false);
            Ok(())
        }

        fn destroy(&self, domain: &str) -> Result<(), ReconcileError> {
            self.set_running(domain, false);
            Ok(())
        }

        fn migrate_live(&self, domain: &str, _target_uri: &str) -> Result<(), ReconcileError> {
            if *self.fail_migrate.lock().unwrap() {
                return Err(ReconcileError::Driver(anyhow::anyhow!("migration path blocked")));
            }
            self.set_running(domain, false);
            Ok(())
        }
    }
}
