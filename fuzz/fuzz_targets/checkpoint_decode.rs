#![no_main]

use libfuzzer_sys::fuzz_target;
use proficio_checkpoint::{decode_snapshot, encode_snapshot};
use proficio_fusion::FusionModel;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must decode to an error, never a panic
    let Ok(snapshot) = decode_snapshot(data) else {
        return;
    };

    // Anything that decodes re-encodes to something decodable
    let bytes = encode_snapshot(&snapshot).expect("decoded snapshot re-encodes");
    let again = decode_snapshot(&bytes).expect("re-encoded snapshot decodes");
    assert_eq!(again.step, snapshot.step);
    assert_eq!(again.tensors.len(), snapshot.tensors.len());

    let _ = FusionModel::restore(&snapshot);
});
