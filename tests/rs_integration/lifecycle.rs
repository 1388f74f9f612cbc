//! Integration tests between a launcher process and an instance already holding the
//! singleton socket.

use core::time::Duration;
use std::time::Instant;

use launcher_common::SingletonMessage;
use launcher_core::ipc::SingletonListener;
use tokio::time;

use crate::common::{Scratch, run_launcher};

#[tokio::test]
async fn stop_is_confirmed_by_the_running_instance() {
    let scratch = Scratch::new("stop_running", "stop_grace_secs = 1\n");
    let (_handle, mut requests) = SingletonListener::bind(&scratch.socket_path())
        .await
        .unwrap()
        .listen();

    let owner = tokio::spawn(async move {
        let request = requests.recv().await.unwrap();
        assert_eq!(request.message, SingletonMessage::StopApp);
        request.responder.confirm_stopped().await;
    });

    let started = Instant::now();
    let output = run_launcher(&scratch, &["stop"]).await;
    assert!(output.status.success(), "{output:?}");
    assert!(
        started.elapsed() >= Duration::from_secs(1),
        "an immediate confirmation still waits out the grace period"
    );
    assert!(
        String::from_utf8_lossy(&output.stdout).contains("Launcher stopped"),
        "{output:?}"
    );
    time::timeout(Duration::from_secs(5), owner)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn second_start_hands_over_to_the_running_instance() {
    let scratch = Scratch::new("second_start", "initial_state = \"running\"\n");
    let (_handle, mut requests) = SingletonListener::bind(&scratch.socket_path())
        .await
        .unwrap()
        .listen();

    let output = time::timeout(Duration::from_secs(20), run_launcher(&scratch, &[]))
        .await
        .unwrap();

    assert!(output.status.success(), "{output:?}");
    let request = requests.recv().await.unwrap();
    assert_eq!(request.message, SingletonMessage::ShowMain);
}
