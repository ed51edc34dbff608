//! Fuzz target: `parse_config`
//!
//! Feeds arbitrary bytes into the configuration parser and checks:
//! - No panics on any input
//! - Item indices are dense and in order
//! - Every accepted item passes its own structural validation
//!
//! cargo fuzz run fuzz_config_parse

#![no_main]

use aquanode::drivers::protection::RuntimeProtectionPolicy;
use aquanode::protocol::{parse_config, MAX_CONFIG_ITEMS};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(items) = parse_config(data, &RuntimeProtectionPolicy::default()) else {
        return;
    };
    assert!(items.len() <= MAX_CONFIG_ITEMS);

    for (i, item) in items.iter().enumerate() {
        assert_eq!(item.index, i, "item indices must follow payload order");
        if let Ok(cfg) = &item.result {
            assert!(cfg.validate().is_ok(), "accepted item fails validation");
            assert_eq!(item.gpio, Some(cfg.gpio));
        }
    }
});
