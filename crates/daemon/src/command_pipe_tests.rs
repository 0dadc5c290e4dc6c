// SPDX-License-Identifier: MIT

use super::*;
use gantry_core::test_support::shell_target;
use gantry_storage::DatabaseParameters;

#[yare::parameterized(
    quit       = { "quit", Some(PipeCommand::Quit) },
    flush      = { "flush", Some(PipeCommand::Flush) },
    checkpoint = { "checkpoint", Some(PipeCommand::Checkpoint) },
    dump       = { "dump-state", Some(PipeCommand::DumpState) },
    padded     = { "  quit  ", Some(PipeCommand::Quit) },
    unknown    = { "reboot", None },
    empty      = { "", None },
)]
fn parse_line_commands(line: &str, expected: Option<PipeCommand>) {
    assert_eq!(PipeCommand::parse(line), expected);
}

#[test]
fn state_dump_is_written_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let params = DatabaseParameters::parse(dir.path().to_str().unwrap()).unwrap();
    let store = TargetStore::open(params).unwrap();
    store.put(shell_target("a", "true")).unwrap();

    let dump_dir = dir.path().join("logs");
    let path = write_state_dump(&store, &dump_dir).unwrap();
    assert_eq!(path, dump_dir.join("state-dump.json"));
    assert!(!dump_dir.join("state-dump.tmp").exists());

    let dump: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(dump.as_array().unwrap().len(), 1);
    assert_eq!(dump[0]["id"], "a");
}

#[tokio::test]
async fn pipe_commands_drive_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let params = DatabaseParameters::parse(dir.path().to_str().unwrap()).unwrap();
    let store = Arc::new(TargetStore::open(params).unwrap());
    store.put(shell_target("a", "true")).unwrap();

    let pipe_path = dir.path().join("admin.pipe");
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    spawn(
        pipe_path.clone(),
        Arc::clone(&store),
        dir.path().join("logs"),
        shutdown_tx,
    );

    // Give the task a moment to create the FIFO.
    for _ in 0..100 {
        if pipe_path.exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    // The sender side needs the reader to be open already; retry briefly.
    let mut sender = loop {
        match tokio::net::unix::pipe::OpenOptions::new().open_sender(&pipe_path) {
            Ok(sender) => break sender,
            Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
        }
    };
    use tokio::io::AsyncWriteExt;
    sender.write_all(b"dump-state\nquit\n").await.unwrap();
    drop(sender);

    tokio::time::timeout(std::time::Duration::from_secs(5), shutdown_rx.changed())
        .await
        .unwrap()
        .unwrap();
    assert!(*shutdown_rx.borrow());

    // The dump landed too.
    for _ in 0..100 {
        if dir.path().join("logs/state-dump.json").exists() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("state dump was not written");
}
