use crate::error::{Error, Result};

use std::collections::HashMap;

use zbus::zvariant::{OwnedObjectPath, OwnedValue};

pub(crate) type PropertyMap = HashMap<String, OwnedValue>;
pub(crate) type ChannelDetails = Vec<(OwnedObjectPath, PropertyMap)>;

fn missing(name: &str) -> Error {
    Error::parse_error(format!("property {name} is missing"))
}

fn mistyped(name: &str, err: impl std::fmt::Display) -> Error {
    Error::parse_error(format!("property {name} has unexpected type: {err}"))
}

pub(crate) fn take_u32(props: &mut PropertyMap, name: &str) -> Result<u32> {
    let value = props.remove(name).ok_or_else(|| missing(name))?;
    u32::try_from(value).map_err(|e| mistyped(name, e))
}

pub(crate) fn take_bool(props: &mut PropertyMap, name: &str) -> Result<bool> {
    let value = props.remove(name).ok_or_else(|| missing(name))?;
    bool::try_from(value).map_err(|e| mistyped(name, e))
}

pub(crate) fn take_string(props: &mut PropertyMap, name: &str) -> Result<String> {
    let value = props.remove(name).ok_or_else(|| missing(name))?;
    String::try_from(value).map_err(|e| mistyped(name, e))
}

pub(crate) fn take_string_list(props: &mut PropertyMap, name: &str) -> Result<Vec<String>> {
    let value = props.remove(name).ok_or_else(|| missing(name))?;
    Vec::<String>::try_from(value).map_err(|e| mistyped(name, e))
}

pub(crate) fn take_path(props: &mut PropertyMap, name: &str) -> Result<OwnedObjectPath> {
    let value = props.remove(name).ok_or_else(|| missing(name))?;
    OwnedObjectPath::try_from(value).map_err(|e| mistyped(name, e))
}

/// `a(oa{sv})`, the channel list carried by dispatch operations.
pub(crate) fn take_channel_details(props: &mut PropertyMap, name: &str) -> Result<ChannelDetails> {
    let value = props.remove(name).ok_or_else(|| missing(name))?;
    ChannelDetails::try_from(value).map_err(|e| mistyped(name, e))
}

pub(crate) fn opt_bool(props: &mut PropertyMap, name: &str) -> Result<Option<bool>> {
    if !props.contains_key(name) {
        return Ok(None);
    }
    take_bool(props, name).map(Some)
}

pub(crate) fn opt_string(props: &mut PropertyMap, name: &str) -> Result<Option<String>> {
    if !props.contains_key(name) {
        return Ok(None);
    }
    take_string(props, name).map(Some)
}

pub(crate) fn opt_string_list(props: &mut PropertyMap, name: &str) -> Result<Option<Vec<String>>> {
    if !props.contains_key(name) {
        return Ok(None);
    }
    take_string_list(props, name).map(Some)
}

/// Validate a Telepathy client name: dot-separated elements, each starting
/// with a letter or underscore and continuing with letters, digits or
/// underscores (the same rules as D-Bus bus-name elements).
pub(crate) fn validate_client_name(input: &str) -> Result<()> {
    if input.is_empty() {
        return Err(Error::invalid_argument("client name must not be empty"));
    }
    for element in input.split('.') {
        let mut chars = element.chars();
        let valid_head = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if !valid_head || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::invalid_argument(format!(
                "invalid client name element {element:?}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use zbus::zvariant::Value;

    fn props() -> PropertyMap {
        let mut map = PropertyMap::new();
        map.insert(
            "Status".to_string(),
            Value::U32(1).try_to_owned().expect("owned"),
        );
        map.insert(
            "Interfaces".to_string(),
            Value::from(vec!["a.b.C"]).try_to_owned().expect("owned"),
        );
        map
    }

    #[test]
    fn takes_typed_properties() {
        let mut map = props();
        assert_eq!(take_u32(&mut map, "Status").expect("u32"), 1);
        assert_eq!(
            take_string_list(&mut map, "Interfaces").expect("list"),
            vec!["a.b.C".to_string()]
        );
    }

    #[test]
    fn missing_property_is_a_parse_error() {
        let mut map = props();
        let err = take_bool(&mut map, "Requested").expect_err("missing");
        let Error::ParseError { context } = err else {
            panic!("unexpected error: {err:?}");
        };
        assert!(context.contains("Requested"));
    }

    #[test]
    fn mistyped_property_is_a_parse_error() {
        let mut map = props();
        let err = take_string(&mut map, "Status").expect_err("mistyped");
        let Error::ParseError { .. } = err else {
            panic!("unexpected error: {err:?}");
        };
    }

    #[test]
    fn optional_properties_distinguish_absent_from_mistyped() {
        let mut map = props();
        assert!(opt_bool(&mut map, "Requested").expect("absent ok").is_none());
        assert!(opt_string(&mut map, "Status").is_err());
    }

    #[test]
    fn accepts_wellformed_client_names() {
        validate_client_name("Ferret").expect("simple");
        validate_client_name("im.example.Ferret_2").expect("dotted");
    }

    #[test]
    fn rejects_malformed_client_names() {
        for bad in ["", ".", "2fast", "a..b", "a b", "a-b"] {
            let err = validate_client_name(bad).expect_err("must fail");
            let Error::InvalidArgument { .. } = err else {
                panic!("unexpected error for {bad:?}: {err:?}");
            };
        }
    }
}
