#![no_main]

use libfuzzer_sys::fuzz_target;

use capdispatch::plugins::capabilities::{PathValidator, SsrfProtection};

fuzz_target!(|data: &str| {
    let validator = PathValidator::new(&["data/".to_string()], &[".json".to_string()]);
    if let Ok(path) = validator.validate_file(data) {
        // An accepted path never climbs out of the capability root.
        assert!(path.is_relative());
        assert!(!path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir)));
        assert!(path.starts_with("data"));
    }
    let _ = validator.with_any_location().validate_dir(data);

    let _ = SsrfProtection::validate_url(data);
});
