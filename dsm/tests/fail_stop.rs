//! Job failures abort the process after logging.
//!
//! Each test re-runs itself in a child process with `DSM_FAIL_STOP_CHILD`
//! set; the child drives the runtime into the failure and must die by
//! `SIGABRT` with the diagnostic on its output.

mod common;

use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus};

use amsg::{Core, Environment, SiteAdapter, SiteGeometry};
use common::{run_job, run_job_with, test_config};

const CHILD_ENV: &str = "DSM_FAIL_STOP_CHILD";
const SIGABRT: i32 = 6;

fn in_child() -> bool {
    std::env::var_os(CHILD_ENV).is_some()
}

fn run_child(test: &str) -> (ExitStatus, String) {
    let out = Command::new(std::env::current_exe().unwrap())
        .args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .env("RUST_LOG", "error")
        .output()
        .unwrap();
    let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&out.stderr));
    (out.status, text)
}

/// Reports a different node size on every core.
struct Skewed;

impl SiteAdapter for Skewed {
    fn name(&self) -> &'static str {
        "skewed"
    }

    fn detect(&self, rank: Core, _env: &dyn Environment) -> amsg::Result<Option<SiteGeometry>> {
        Ok(Some(SiteGeometry {
            local_rank: 0,
            local_size: rank + 1,
        }))
    }
}

#[test]
fn mismatched_locale_sizes_abort() {
    if in_child() {
        run_job_with(
            2,
            |_| vec![Box::new(Skewed) as Box<dyn SiteAdapter>],
            |core| core as u16 + 1,
            test_config("skew", 0x5da0_0000_0000),
            |_| (),
        );
        panic!("init returned on mismatched locales");
    }
    let (status, output) = run_child("mismatched_locale_sizes_abort");
    assert_eq!(status.signal(), Some(SIGABRT), "{output}");
    assert!(output.contains("locales disagree on core count"), "{output}");
}

#[test]
fn heap_bring_up_failure_aborts() {
    if in_child() {
        // Not page aligned, so no core can map the segment.
        let mut config = test_config("misaligned", 0x5db0_0000_0000);
        config.heap.base_address += 8;
        run_job(2, 2, config, |mut rt| {
            let _ = rt.activate();
        });
        panic!("activate returned after a heap failure");
    }
    let (status, output) = run_child("heap_bring_up_failure_aborts");
    assert_eq!(status.signal(), Some(SIGABRT), "{output}");
    assert!(output.contains("fatal runtime error"), "{output}");
}

#[test]
fn allocation_failure_aborts_with_usage() {
    if in_child() {
        run_job(1, 1, test_config("oom_abort", 0x5dc0_0000_0000), |mut rt| {
            rt.activate().unwrap();
            rt.allocate(64 << 20, 16);
        });
        panic!("allocate returned on an exhausted heap");
    }
    let (status, output) = run_child("allocation_failure_aborts_with_usage");
    assert_eq!(status.signal(), Some(SIGABRT), "{output}");
    assert!(output.contains("shared heap exhausted"), "{output}");
}

#[test]
fn misuse_is_returned_not_fatal() {
    run_job(1, 1, test_config("misuse", 0x5dd0_0000_0000), |mut rt| {
        assert!(matches!(rt.try_allocate(8, 8), Err(dsm::Error::State { .. })));
        rt.activate().unwrap();
        assert!(matches!(rt.activate(), Err(dsm::Error::State { op: "activate", .. })));
        assert!(matches!(
            rt.try_allocate(8, 3),
            Err(dsm::Error::Heap(shmheap::HeapError::InvalidConfig(_)))
        ));
        rt.finish().unwrap();
    });
}
