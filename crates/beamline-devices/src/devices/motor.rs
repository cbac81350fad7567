/*!
 * Positioner device.
 *
 * A motor is a feedback channel, a setpoint, a moving flag and a stop
 * command. Moves are refused while the motor is inactive or unhealthy and
 * skipped when the target is already within precision.
 */
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use beamline_core::config::MotorConfig;
use beamline_core::types::Value;
use beamline_core::wait::{wait_for, StopSignal, WaitOptions};

use crate::channel::{Channel, ChannelEvent};
use crate::device::{Device, DeviceContext, DeviceCore, DeviceEvent, Severity};
use crate::error::{DeviceError, Result};

/// Motor device
pub struct Motor {
    core: Arc<DeviceCore>,
    /// Readback
    feedback: Arc<Channel>,
    /// Target position
    setpoint: Arc<Channel>,
    stop_cmd: Arc<Channel>,
    precision: f64,
    config: MotorConfig,
    /// Set between issuing a move and the end of the wait
    command_sent: AtomicBool,
    /// The moving flag rose after the last command
    motion_seen: AtomicBool,
    /// Last requested target, as `f64` bits
    target: AtomicU64,
}

impl fmt::Debug for Motor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Motor")
            .field("name", &self.core.name())
            .field("feedback", &self.feedback.name())
            .field("precision", &self.precision)
            .field("busy", &self.core.is_busy())
            .finish()
    }
}

impl Motor {
    /// Create a motor on the `{pv}:fbk`, `{pv}:sp`, `{pv}:moving`,
    /// `{pv}:stop` and `{pv}:calibrated` channels
    pub fn new(context: &DeviceContext, name: &str, pv: &str, precision: f64) -> Result<Arc<Self>> {
        if !(precision.is_finite() && precision >= 0.0) {
            return Err(DeviceError::configuration(format!(
                "{}: invalid precision {}",
                name, precision
            )));
        }
        let core = DeviceCore::new(context, "motor", name);
        let config = context.config().motor.clone();

        let motor = Arc::new_cyclic(|weak: &Weak<Motor>| {
            let feedback = core.add_channel(&format!("{}:fbk", pv), true);
            let setpoint = core.add_channel(&format!("{}:sp", pv), false);
            let moving = core.add_channel(&format!("{}:moving", pv), true);
            let stop_cmd = core.add_channel(&format!("{}:stop", pv), false);
            let calibrated = core.add_channel(&format!("{}:calibrated", pv), true);

            let handle = weak.clone();
            feedback.subscribe("changed", move |event| {
                if let (Some(motor), ChannelEvent::Changed(value)) = (handle.upgrade(), event) {
                    motor.core.emit(DeviceEvent::Changed(value.clone()));
                }
            });
            let handle = weak.clone();
            moving.subscribe("changed", move |event| {
                if let (Some(motor), ChannelEvent::Changed(value)) = (handle.upgrade(), event) {
                    motor.on_moving(value);
                }
            });
            let handle = weak.clone();
            calibrated.subscribe("changed", move |event| {
                if let (Some(motor), ChannelEvent::Changed(value)) = (handle.upgrade(), event) {
                    motor.on_calibration(value);
                }
            });

            Motor {
                core: core.clone(),
                feedback,
                setpoint,
                stop_cmd,
                precision,
                config,
                command_sent: AtomicBool::new(false),
                motion_seen: AtomicBool::new(false),
                target: AtomicU64::new(f64::NAN.to_bits()),
            }
        });
        motor.core.start()?;
        Ok(motor)
    }

    fn on_moving(&self, value: &Value) {
        let busy = value.is_set();
        if busy && self.command_sent.load(Ordering::SeqCst) {
            self.motion_seen.store(true, Ordering::SeqCst);
        }
        self.core.set_busy(busy);
    }

    fn on_calibration(&self, value: &Value) {
        if value.is_null() {
            return;
        }
        if value.is_set() {
            self.core.remove_health("calibration");
        } else {
            self.core
                .add_health(Severity::Serious, "calibration", "Not calibrated.");
        }
    }

    /// Current position
    pub fn position(&self) -> Result<f64> {
        let value = self.feedback.value()?;
        value
            .as_float()
            .ok_or_else(|| DeviceError::parse(format!("{}: position {} is not numeric", self.name(), value)))
    }

    /// Positioning tolerance
    pub fn precision(&self) -> f64 {
        self.precision
    }

    /// Whether a move to `target` would do anything
    pub fn needs_move(&self, target: f64) -> bool {
        self.position()
            .map_or(true, |current| (current - target).abs() > self.precision)
    }

    fn is_sane(&self) -> bool {
        self.is_active() && self.health().0 < Severity::Serious
    }

    fn at_target(&self) -> bool {
        let target = f64::from_bits(self.target.load(Ordering::SeqCst));
        self.position()
            .map_or(false, |current| (current - target).abs() <= self.precision)
    }

    /// Move to `target`. Returns whether the motor got there when `wait` is
    /// set; otherwise returns once the command is written.
    pub async fn move_to(&self, target: f64, wait: bool) -> Result<bool> {
        if !self.is_sane() {
            warn!("({}) is not in a sane state, move canceled", self.name());
            return Err(DeviceError::invalid_state(format!(
                "{} is not in a sane state, move canceled",
                self.name()
            )));
        }
        if !self.needs_move(target) {
            debug!("({}) already at {}, move canceled", self.name(), target);
            return Ok(true);
        }

        self.target.store(target.to_bits(), Ordering::SeqCst);
        self.motion_seen.store(false, Ordering::SeqCst);
        self.command_sent.store(true, Ordering::SeqCst);
        info!("({}) moving to {}", self.name(), target);
        if let Err(e) = self.setpoint.set(target).await {
            self.command_sent.store(false, Ordering::SeqCst);
            return Err(e);
        }

        if wait {
            Ok(self.wait(None).await)
        } else {
            Ok(true)
        }
    }

    /// Move by `delta` from the current position
    pub async fn move_by(&self, delta: f64, wait: bool) -> Result<bool> {
        let current = self.position()?;
        self.move_to(current + delta, wait).await
    }

    /// Wait for the last move to start and finish
    pub async fn wait(&self, cancel: Option<&StopSignal>) -> bool {
        let options = WaitOptions::new(self.config.poll(), Duration::from_millis(self.config.timeout_ms))
            .with_start_timeout(Duration::from_millis(self.config.start_timeout_ms));
        let started = || {
            self.motion_seen.load(Ordering::SeqCst) || self.is_busy() || self.at_target()
        };
        let done = wait_for(self.name(), started, || self.is_busy(), &options, cancel).await;
        self.command_sent.store(false, Ordering::SeqCst);
        done
    }

    /// Stop any motion
    pub async fn stop(&self) -> Result<()> {
        info!("({}) stopping", self.name());
        self.stop_cmd.set(1).await
    }
}

impl Device for Motor {
    fn core(&self) -> &Arc<DeviceCore> {
        &self.core
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::device::tests::context;
    use crate::sim::simulate_motor;

    #[tokio::test]
    async fn test_move_and_wait() {
        let (context, sim) = context();
        simulate_motor(&sim, "BL:energy", 12.0);
        let motor = Motor::new(&context, "energy", "BL:energy", 0.001).unwrap();
        context.dispatcher().flush().await;
        assert!(motor.is_active());

        assert!(motor.move_to(12.658, true).await.unwrap());
        assert!((motor.position().unwrap() - 12.658).abs() < 1e-9);
        assert!(!motor.is_busy());
        assert_eq!(sim.writes_to("BL:energy:sp"), vec![Value::Float(12.658)]);
    }

    #[tokio::test]
    async fn test_move_within_precision_is_skipped() {
        let (context, sim) = context();
        simulate_motor(&sim, "BL:distance", 250.0);
        let motor = Motor::new(&context, "distance", "BL:distance", 0.01).unwrap();
        context.dispatcher().flush().await;

        assert!(!motor.needs_move(250.005));
        assert!(motor.move_to(250.005, true).await.unwrap());
        assert!(sim.writes_to("BL:distance:sp").is_empty());
    }

    #[tokio::test]
    async fn test_inactive_motor_refuses_moves() {
        let (context, sim) = context();
        sim.set_offline("BL:omega:fbk");
        let motor = Motor::new(&context, "omega", "BL:omega", 0.01).unwrap();
        context.dispatcher().flush().await;

        let err = motor.move_to(10.0, false).await.unwrap_err();
        assert!(matches!(err, DeviceError::InvalidState(_)));
        assert!(err.to_string().contains("omega is not in a sane state, move canceled"));
        assert!(sim.writes().is_empty());
    }

    #[tokio::test]
    async fn test_uncalibrated_motor_refuses_moves() {
        let (context, sim) = context();
        simulate_motor(&sim, "BL:kappa", 0.0);
        sim.set_value("BL:kappa:calibrated", 0);
        let motor = Motor::new(&context, "kappa", "BL:kappa", 0.01).unwrap();
        context.dispatcher().flush().await;

        assert_eq!(motor.health(), (Severity::Serious, "Not calibrated.".to_string()));
        assert!(motor.move_to(5.0, false).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_motor_times_out_on_start() {
        let (context, sim) = context();
        sim.set_value("BL:phi:fbk", 0.0);
        sim.set_value("BL:phi:moving", 0);
        let motor = Motor::new(&context, "phi", "BL:phi", 0.01).unwrap();
        context.dispatcher().flush().await;

        let begin = tokio::time::Instant::now();
        assert!(!motor.move_to(90.0, true).await.unwrap());
        assert!(begin.elapsed() >= Duration::from_millis(context.config().motor.start_timeout_ms));
    }

    #[test]
    fn test_invalid_precision() {
        tokio_test::block_on(async {
            let (context, _) = context();
            assert!(matches!(
                Motor::new(&context, "bad", "BL:bad", f64::NAN),
                Err(DeviceError::Configuration(_))
            ));
        });
    }
}
