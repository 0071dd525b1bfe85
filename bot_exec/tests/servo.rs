//! Servo loop behaviour against the emulated plant.

use std::{sync::Arc, thread, time::Duration};

use nalgebra::DVector;

use bot_lib::{
    joint_state::{JointState, StateBuffer},
    ref_buf::{ControlLaw, RefBuffer},
    servo::{
        Actuator, ActuatorError, ControlCommand, Emulator, Params, Servo, ServoError, ServoLoop,
    },
};

/// Emulator which faults after a fixed number of commands.
struct FaultyActuator {
    emulator: Emulator,
    commands_left: usize,
}

impl Actuator for FaultyActuator {
    fn get_state(&mut self) -> Result<JointState, ActuatorError> {
        self.emulator.get_state()
    }

    fn send_command(&mut self, cmd: &ControlCommand) -> Result<(), ActuatorError> {
        if self.commands_left == 0 {
            return Err(ActuatorError::Fault("drive overcurrent".into()));
        }
        self.commands_left -= 1;
        self.emulator.send_command(cmd)
    }
}

#[test]
fn test_config_refs_converge_without_overshoot() {
    let tau = 1e-3;
    let ref_buf = Arc::new(RefBuffer::at_rest(
        DVector::from_element(1, 1.0),
        0.0,
        ControlLaw::ConfigRefs {
            decay_time: 0.2,
            damping_ratio: 1.0,
        },
    ));
    let state_buf = Arc::new(StateBuffer::new());

    let mut servo = Servo::new(
        Box::new(Emulator::new(DVector::zeros(1), tau)),
        ref_buf,
        state_buf.clone(),
    );

    let mut max_q = f64::MIN;
    for _ in 0..2000 {
        let tick = servo.step().unwrap();
        max_q = max_q.max(tick.state.q[0]);
    }

    let last = state_buf.get().unwrap().unwrap();
    assert!((last.time - 1.999).abs() < 1e-9);

    // One more tick to see the state after the 2000th command
    let tick = servo.step().unwrap();
    max_q = max_q.max(tick.state.q[0]);

    assert!((tick.state.q[0] - 1.0).abs() < 1e-3);
    assert!(tick.state.q_dot[0].abs() < 1e-3);
    assert!(max_q < 1.0 + 1e-3, "overshoot to {}", max_q);
}

#[test]
fn test_actuator_fault_surfaces_on_stop() {
    let ref_buf = Arc::new(RefBuffer::at_rest(
        DVector::zeros(2),
        0.0,
        ControlLaw::default(),
    ));
    let state_buf = Arc::new(StateBuffer::new());

    let actuator = FaultyActuator {
        emulator: Emulator::new(DVector::zeros(2), 1e-3),
        commands_left: 50,
    };
    let servo = Servo::new(Box::new(actuator), ref_buf, state_buf.clone());
    let handle = ServoLoop::start(servo, &Params::default()).unwrap();

    for _ in 0..1000 {
        if !handle.is_running() {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert!(!handle.is_running());

    // States were published up to the fault
    assert_eq!(state_buf.revision().unwrap(), 51);

    match handle.stop() {
        Err(ServoError::Actuator(ActuatorError::Fault(msg))) => assert!(msg.contains("overcurrent")),
        other => panic!("expected an actuator fault, got {:?}", other.map(|s| s.ticks)),
    }
}

#[test]
fn test_servo_thread_stops_cleanly() {
    let ref_buf = Arc::new(RefBuffer::at_rest(
        DVector::zeros(3),
        0.0,
        ControlLaw::default(),
    ));
    let state_buf = Arc::new(StateBuffer::new());

    let servo = Servo::new(
        Box::new(Emulator::new(DVector::zeros(3), 1e-3)),
        ref_buf,
        state_buf.clone(),
    );
    let handle = ServoLoop::start(servo, &Params::default()).unwrap();

    let (rev, state) = state_buf
        .wait_for_revision(0, Duration::from_secs(1))
        .unwrap();
    assert!(rev >= 1);
    assert_eq!(state.dof(), 3);

    thread::sleep(Duration::from_millis(20));
    let summary = handle.stop().unwrap();
    assert!(summary.ticks >= rev);
}
