#![no_main]
use artifact_cache::{decode_frame, ClusterReply, ClusterRequest};
use libfuzzer_sys::fuzz_target;

// Malformed frames must be rejected without panicking
fuzz_target!(|frame: &[u8]| {
    let _ = decode_frame::<ClusterRequest>(frame);
    let _ = decode_frame::<ClusterReply>(frame);
});
