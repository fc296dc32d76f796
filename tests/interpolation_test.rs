//! Interpolation through the config read path: references resolve against
//! the whole tree, cycles are rejected, and templated values never go stale.

use figtree::{
    Config, Error, InterpolationError, Options, SharedBuffer, Value,
};

fn interpolating_config() -> Config {
    Config::with_options(Options {
        interpolate_values: true,
        ..Options::default()
    })
    .unwrap()
}

#[test]
fn test_references_resolve_through_chains() {
    let mut cfg = interpolating_config();
    cfg.set_value("a", 1).unwrap();
    cfg.set_value("b", "{!a}x").unwrap();
    cfg.set_value("c", "{!b}y").unwrap();

    assert_eq!(cfg.value("c").unwrap(), Value::Str("1xy".into()));
    assert_eq!(cfg.value("b").unwrap(), Value::Str("1x".into()));
}

#[test]
fn test_cycle_is_detected_from_either_end() {
    let mut cfg = interpolating_config();
    cfg.set_value("a", "{!b}").unwrap();
    cfg.set_value("b", "{!a}").unwrap();

    for key in ["a", "b"] {
        assert!(matches!(
            cfg.value(key),
            Err(Error::Interpolation(InterpolationError::Cycle(_))),
        ));
    }
}

#[test]
fn test_unknown_reference() {
    let mut cfg = interpolating_config();
    cfg.set_value("a", "{!missing}").unwrap();
    assert!(matches!(
        cfg.value("a"),
        Err(Error::Interpolation(InterpolationError::UnknownKey(_))),
    ));
}

#[test]
fn test_references_convert_to_the_section_type() {
    let mut cfg = interpolating_config();
    cfg.set_value("base", 8000).unwrap();
    cfg.init("port", 0).unwrap();
    cfg.set_raw_value("port", "{!base}").unwrap();

    assert_eq!(cfg.value("port").unwrap(), Value::Int(8000));

    // templated values track their target instead of caching
    cfg.set_value("base", 9000).unwrap();
    assert_eq!(cfg.value("port").unwrap(), Value::Int(9000));
}

#[test]
fn test_interpolation_across_sources() {
    let buffer = SharedBuffer::with_contents(
        "[host] = 8.8.8.8\n\n[url] = http://{!host}/\n",
    );
    let mut cfg = interpolating_config();
    cfg.add_source(buffer.clone());
    cfg.sync().unwrap();

    assert_eq!(
        cfg.value("url").unwrap(),
        Value::Str("http://8.8.8.8/".into())
    );
    // the raw template survives the round trip
    assert_eq!(
        buffer.text(),
        "[host] = 8.8.8.8\n\n[url] = http://{!host}/\n"
    );
}

#[test]
fn test_disabled_interpolation_passes_markers_through() {
    let mut cfg = Config::new();
    cfg.set_value("a", 1).unwrap();
    cfg.set_value("b", "{!a}x").unwrap();
    assert_eq!(cfg.value("b").unwrap(), Value::Str("{!a}x".into()));
}
