//! CLI smoke tests.

use assert_cmd::Command;

#[test]
fn help_lists_subcommands() {
    let mut cmd = Command::cargo_bin("straylight").expect("binary");
    let output = cmd.arg("--help").output().expect("run");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    for subcommand in ["start", "process", "status"] {
        assert!(
            stdout.contains(subcommand),
            "--help should mention {subcommand}"
        );
    }
}

#[test]
fn unknown_subcommand_fails() {
    let mut cmd = Command::cargo_bin("straylight").expect("binary");
    let output = cmd.arg("definitely-not-a-command").output().expect("run");
    assert!(!output.status.success());
}

#[test]
fn status_on_fresh_journal_reports_no_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cmd = Command::cargo_bin("straylight").expect("binary");
    let output = cmd
        .arg("status")
        .env("STRAYLIGHT_JOURNAL_DB", dir.path().join("journal.db"))
        .env("STRAYLIGHT_LOGS_DIR", dir.path().join("logs"))
        .output()
        .expect("run");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("no entries"));
}
