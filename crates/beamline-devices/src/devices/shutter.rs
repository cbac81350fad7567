/*!
 * Two-state shutter.
 */
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, info};

use beamline_core::config::ShutterConfig;
use beamline_core::wait::{wait_until, StopSignal};

use crate::channel::{Channel, ChannelEvent};
use crate::device::{Device, DeviceContext, DeviceCore, DeviceEvent};
use crate::error::Result;

/// Shutter driven by separate open and close commands
pub struct Shutter {
    core: Arc<DeviceCore>,
    state: Arc<Channel>,
    open_cmd: Arc<Channel>,
    close_cmd: Arc<Channel>,
    config: ShutterConfig,
}

impl fmt::Debug for Shutter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shutter")
            .field("name", &self.core.name())
            .field("open", &self.is_open())
            .finish()
    }
}

impl Shutter {
    /// Create a shutter on `{pv}:state`, `{pv}:opr:open` and `{pv}:opr:close`
    pub fn new(context: &DeviceContext, name: &str, pv: &str) -> Result<Arc<Self>> {
        let core = DeviceCore::new(context, "shutter", name);
        let config = context.config().shutter.clone();
        let shutter = Arc::new_cyclic(|weak: &Weak<Shutter>| {
            let state = core.add_channel(&format!("{}:state", pv), true);
            let handle = weak.clone();
            state.subscribe("changed", move |event| {
                if let (Some(shutter), ChannelEvent::Changed(value)) = (handle.upgrade(), event) {
                    debug!("({}) state {}", shutter.core.name(), value);
                    shutter.core.emit(DeviceEvent::Changed(value.clone()));
                }
            });
            Shutter {
                core: core.clone(),
                open_cmd: core.add_channel(&format!("{}:opr:open", pv), false),
                close_cmd: core.add_channel(&format!("{}:opr:close", pv), false),
                state,
                config,
            }
        });
        shutter.core.start()?;
        Ok(shutter)
    }

    /// Whether the shutter reports open
    pub fn is_open(&self) -> bool {
        self.state.value().map_or(false, |v| v.is_set())
    }

    /// Open the shutter
    pub async fn open(&self, wait: bool) -> Result<bool> {
        self.change(true, wait).await
    }

    /// Close the shutter
    pub async fn close(&self, wait: bool) -> Result<bool> {
        self.change(false, wait).await
    }

    async fn change(&self, open: bool, wait: bool) -> Result<bool> {
        if self.state.value()?.is_set() == open {
            return Ok(true);
        }
        info!("({}) {}", self.name(), if open { "opening" } else { "closing" });
        if open {
            self.open_cmd.set(1).await?;
        } else {
            self.close_cmd.set(1).await?;
        }
        if wait {
            Ok(self.wait(open, None).await)
        } else {
            Ok(true)
        }
    }

    /// Wait until the shutter reports `open`
    pub async fn wait(&self, open: bool, cancel: Option<&StopSignal>) -> bool {
        wait_until(
            self.name(),
            || self.is_open() == open,
            Duration::from_millis(self.config.poll_ms),
            Duration::from_millis(self.config.timeout_ms),
            cancel,
        )
        .await
    }
}

impl Device for Shutter {
    fn core(&self) -> &Arc<DeviceCore> {
        &self.core
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::device::tests::context;
    use crate::sim::simulate_shutter;

    #[tokio::test]
    async fn test_open_close() {
        let (context, sim) = context();
        simulate_shutter(&sim, "BL:shutter");
        let shutter = Shutter::new(&context, "shutter", "BL:shutter").unwrap();
        context.dispatcher().flush().await;

        assert!(shutter.open(true).await.unwrap());
        assert!(shutter.is_open());
        assert!(shutter.close(true).await.unwrap());
        assert!(!shutter.is_open());
    }

    #[tokio::test]
    async fn test_close_when_closed_issues_nothing() {
        let (context, sim) = context();
        simulate_shutter(&sim, "BL:shutter");
        let shutter = Shutter::new(&context, "shutter", "BL:shutter").unwrap();
        context.dispatcher().flush().await;

        assert!(shutter.close(true).await.unwrap());
        assert!(sim.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_shutter_times_out() {
        let (context, sim) = context();
        sim.set_value("BL:fast:state", 0);
        let shutter = Shutter::new(&context, "fast", "BL:fast").unwrap();
        context.dispatcher().flush().await;

        assert!(!shutter.open(true).await.unwrap());
        assert_eq!(sim.writes_to("BL:fast:opr:open").len(), 1);
    }
}
