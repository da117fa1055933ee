#![no_main]

use libfuzzer_sys::fuzz_target;
use tradenet_core::core_store::model::payload::PersistablePayload;
use tradenet_core::core_store::model::record::ProtectedRecord;
use tradenet_core::core_store::store::snapshot::decode_blob;

fuzz_target!(|data: &[u8]| {
    // Corrupt files on disk must surface as errors
    let _ = decode_blob::<Vec<ProtectedRecord>>("fuzz", data);
    let _ = decode_blob::<Vec<PersistablePayload>>("fuzz", data);
});
