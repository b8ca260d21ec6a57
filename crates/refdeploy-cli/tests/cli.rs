use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;

fn refdeploy(installation: &Path, args: &[&str]) -> assert_cmd::assert::Assert {
    cargo_bin_cmd!("refdeploy")
        .arg("--installation")
        .arg(installation)
        .args(args)
        .env("XDG_CACHE_HOME", installation.join("cache"))
        .assert()
}

fn stdout(assert: &assert_cmd::assert::Assert) -> String {
    String::from_utf8_lossy(&assert.get_output().stdout).into_owned()
}

#[test]
fn help_lists_the_command_groups() {
    let assert = cargo_bin_cmd!("refdeploy").arg("--help").assert().success();
    let output = stdout(&assert);
    for command in ["install", "uninstall", "remote-add", "unused", "cleanup"] {
        assert!(output.contains(command), "help is missing {command}: {output}");
    }
}

#[test]
fn remotes_can_be_added_listed_and_removed() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let base = tmp.path().join("installation");

    refdeploy(&base, &["remote-add", "origin", "https://dl.example.com/repo/", "--no-gpg-verify", "--prio", "5"])
        .success();
    let listed = refdeploy(&base, &["remotes"]).success();
    let output = stdout(&listed);
    assert!(
        output.contains("origin\thttps://dl.example.com/repo/\t5\tno-gpg-verify"),
        "unexpected remotes output: {output}"
    );

    refdeploy(&base, &["remote-delete", "origin"]).success();
    let listed = refdeploy(&base, &["remotes"]).success();
    assert!(stdout(&listed).trim().is_empty());
}

#[test]
fn remotes_need_a_key_when_verification_is_on() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let base = tmp.path().join("installation");
    refdeploy(&base, &["remote-add", "origin", "https://dl.example.com/repo/"]).failure();
}

#[test]
fn user_errors_exit_with_one() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let base = tmp.path().join("installation");

    let missing = refdeploy(&base, &["install", "nowhere", "app/org.test.App/x86_64/stable"]).code(1);
    let stderr = String::from_utf8_lossy(&missing.get_output().stderr).into_owned();
    assert!(stderr.contains("nowhere"), "stderr: {stderr}");

    refdeploy(&base, &["uninstall", "app/org.test.App/x86_64/stable"]).code(1);
    refdeploy(&base, &["update", "not-a-ref"]).code(1);
}

#[test]
fn empty_installations_list_nothing() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let base = tmp.path().join("installation");
    let listed = refdeploy(&base, &["list"]).success();
    assert!(stdout(&listed).trim().is_empty());
    let unused = refdeploy(&base, &["unused"]).success();
    assert!(stdout(&unused).trim().is_empty());
    let cleanup = refdeploy(&base, &["cleanup"]).success();
    assert!(stdout(&cleanup).contains("Removed 0 old deployments"));
    assert!(base.join("repo/config").exists());
}
