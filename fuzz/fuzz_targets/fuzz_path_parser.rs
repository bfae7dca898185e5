#![no_main]

use ftui_state::parse_path;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    match parse_path(input) {
        Ok(parsed) => {
            // The display form is canonical: it must reparse to the same path.
            let canonical = parsed.to_string();
            assert_eq!(parse_path(&canonical).as_ref(), Ok(&parsed));
        }
        Err(err) => assert!(err.offset <= input.len()),
    }
});
