//! Process exit and restart for the update and restart endpoints.

use ciwi_api::ServerLifecycle;
use std::time::Duration;
use tracing::{error, info};

pub struct ProcessLifecycle {
    /// A service manager restarts the process after it exits.
    service_managed: bool,
}

impl ProcessLifecycle {
    pub fn new(service_managed: bool) -> Self {
        Self { service_managed }
    }
}

fn relaunch() -> std::io::Result<()> {
    let exe = std::env::current_exe()?;
    std::process::Command::new(exe)
        .args(std::env::args().skip(1))
        .spawn()?;
    Ok(())
}

impl ServerLifecycle for ProcessLifecycle {
    fn exit_after(&self, delay: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!("exiting");
            std::process::exit(0);
        });
    }

    fn restart_after(&self, delay: Duration) {
        let service_managed = self.service_managed;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if service_managed {
                info!("exiting for service manager restart");
                std::process::exit(1);
            }
            match relaunch() {
                Ok(()) => {
                    info!("relaunched server, exiting");
                    std::process::exit(0);
                }
                Err(e) => error!(error = %e, "restart failed"),
            }
        });
    }
}
