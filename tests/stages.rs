// The stage executables chained over shared memory, as an operator would run them.
// Run with: cargo test --test stages -- --nocapture

use std::process::{Command, Output, Stdio};

fn namespace(tag: &str) -> String {
    format!("t{}-{}", std::process::id(), tag)
}

fn stage(exe: &str, namespace: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(exe);
    cmd.args(["--no-console", "--namespace", namespace])
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn assert_success(name: &str, output: &Output) {
    assert!(
        output.status.success(),
        "{} exited with {:?}\nstdout:\n{}\nstderr:\n{}",
        name,
        output.status,
        text(&output.stdout),
        text(&output.stderr)
    );
}

#[test]
fn test_frametest_framefilt_framedigest_chain() {
    let ns = namespace("chain");

    // Downstream first: each stage retries its connect until upstream appears
    let digest = stage(env!("CARGO_BIN_EXE_framedigest"), &ns, &["inv"])
        .spawn()
        .unwrap();
    let filter = stage(
        env!("CARGO_BIN_EXE_framefilt"),
        &ns,
        &["--readers", "1", "invert", "raw", "inv"],
    )
    .spawn()
    .unwrap();
    let source = stage(
        env!("CARGO_BIN_EXE_frametest"),
        &ns,
        &["--readers", "1", "-n", "5", "--fps", "0", "--rows", "48", "--cols", "64", "raw"],
    )
    .spawn()
    .unwrap();

    let source = source.wait_with_output().unwrap();
    assert_success("frametest", &source);
    let filter = filter.wait_with_output().unwrap();
    assert_success("framefilt", &filter);
    let digest = digest.wait_with_output().unwrap();
    assert_success("framedigest", &digest);

    let stdout = text(&digest.stdout);
    println!("{}", stdout);
    assert!(stdout.contains("framedigest received end-of-stream"));

    let digests: Vec<(u64, &str)> = stdout
        .lines()
        .filter_map(|line| line.split_once(' '))
        .filter_map(|(seq, hash)| Some((seq.parse().ok()?, hash)))
        .collect();
    assert!(!digests.is_empty(), "no frames reached the end of the chain");
    assert!(digests.windows(2).all(|w| w[0].0 < w[1].0));
    assert!(digests.iter().all(|(seq, _)| (1..=5).contains(seq)));
    assert!(digests
        .iter()
        .all(|(_, hash)| hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit())));
}

#[test]
fn test_missing_upstream_fails_after_connect_timeout() {
    let ns = namespace("timeout");
    let output = stage(
        env!("CARGO_BIN_EXE_framedigest"),
        &ns,
        &["--connect-timeout", "1", "missing"],
    )
    .output()
    .unwrap();

    assert!(!output.status.success());
    let stderr = text(&output.stderr);
    assert!(stderr.contains("framedigest: error"), "stderr: {}", stderr);
    assert!(stderr.contains("missing"), "stderr: {}", stderr);
}

#[test]
fn test_unrepresentable_rates_are_rejected() {
    let ns = namespace("rates");
    for (exe, args) in [
        (env!("CARGO_BIN_EXE_frametest"), ["--fps", "1e-320", "raw"]),
        (env!("CARGO_BIN_EXE_positest"), ["--rate", "1e-320", "rpos"]),
    ] {
        let output = stage(exe, &ns, &args).output().unwrap();
        let stderr = text(&output.stderr);
        assert!(!output.status.success(), "{} accepted a tiny rate", exe);
        assert!(stderr.contains("out of range"), "stderr: {}", stderr);
        assert!(!stderr.contains("panicked"), "stderr: {}", stderr);
    }
}
