#![no_main]
use fwflow::unpack::{tar::TarUnpacker, Unpacker};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let unpacker = TarUnpacker::new();
    if unpacker.accepts(data) {
        let _ = unpacker.extract(data);
    }
});
