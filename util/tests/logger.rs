//! Logger routing. The logger is global, so this file holds a single test.

use std::{env, fs};

use util::{
    host::SW_ROOT_ENV_VAR,
    logger::{logger_init, LevelFilter, SERVO_LOG_FILE},
    session::Session,
};

#[test]
fn test_servo_records_go_to_their_own_file() {
    let root = env::temp_dir().join(format!("bot_sw_logger_{}", std::process::id()));
    fs::create_dir_all(&root).unwrap();
    env::set_var(SW_ROOT_ENV_VAR, &root);

    let session = Session::new("logger_test", "sessions").unwrap();

    assert!(logger_init(LevelFilter::Debug, LevelFilter::Trace, &session).is_ok());

    log::trace!(target: "bot_lib::servo::run", "servo tick overran");
    log::info!(target: "bot_lib::servo", "servo loop started");
    log::debug!(target: "bot_lib::cycle", "cycle re-planned");
    log::trace!(target: "bot_lib::cycle", "cycle segment written");

    let main = fs::read_to_string(&session.log_file_path).unwrap();
    let servo = fs::read_to_string(session.session_root.join(SERVO_LOG_FILE)).unwrap();

    assert!(main.contains("servo loop started"));
    assert!(main.contains("cycle re-planned"));
    assert!(!main.contains("servo tick overran"));
    assert!(!main.contains("cycle segment written"));

    assert!(servo.contains("servo tick overran"));
    assert!(servo.contains("servo loop started"));
    assert!(!servo.contains("cycle re-planned"));

    session.exit();
    fs::remove_dir_all(&root).ok();
}
