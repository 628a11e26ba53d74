use std::sync::atomic::{AtomicU32, Ordering};

use crate::core::{remove_resources, ChatConfig, ShmemConfig};


static RESOURCE_COUNTER: AtomicU32 = AtomicU32::new(1);

fn next_id() -> u32 {
    RESOURCE_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// A System V key no other test process is using.
pub(crate) fn unique_gate_key() -> i32 {
    let pid = std::process::id() & 0x3fff;
    (0x4000_0000 | (pid << 16) | (next_id() & 0xffff)) as i32
}

/// Segment and gate private to one test, removed from the kernel on drop.
pub(crate) struct TestResources {
    pub cfg: ChatConfig,
}

impl TestResources {
    pub fn new(capacity: usize) -> TestResources {
        let shmem = ShmemConfig::builder()
            .segment_name(format!("shmchat-test-{}-{}", std::process::id(), next_id()))
            .gate_key(unique_gate_key())
            .capacity(capacity)
            .build()
            .expect("test config");
        TestResources {
            cfg: ChatConfig {
                shmem,
                poll_interval_ms: 10,
            },
        }
    }

    pub fn shmem(&self) -> &ShmemConfig {
        &self.cfg.shmem
    }
}

impl Drop for TestResources {
    fn drop(&mut self) {
        let _ = remove_resources(&self.cfg.shmem);
    }
}
