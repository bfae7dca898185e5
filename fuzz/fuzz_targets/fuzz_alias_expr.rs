#![no_main]

use ftui_state::Registry;
use ftui_state::expr::alias_body;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    if raw.len() > 512 {
        return;
    }
    let registry = Registry::new();
    if let Some(body) = alias_body(raw) {
        let _ = registry.match_alias(body);
    }
    let _ = registry.match_alias(raw);
});
