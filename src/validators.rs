//! Grammar checks for D-Bus names and object paths.
//!
//! These are enforced at every ingress: message construction, proxy setup,
//! and the bus-level wrappers all route through the `assert_*` functions
//! before anything touches the wire.

use crate::error::{
    InvalidBusNameError, InvalidInterfaceNameError, InvalidMemberNameError,
    InvalidObjectPathError,
};

const MAX_NAME_LENGTH: usize = 255;

fn is_element_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_element_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Check whether a string is a valid bus name.
///
/// Well-known names are dot-separated with at least two elements, each
/// matching `[A-Za-z_-][A-Za-z0-9_-]*`. Unique names start with `:` and may
/// use digits anywhere in their elements.
pub fn is_bus_name_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }

    if let Some(rest) = name.strip_prefix(':') {
        // Unique name: elements may start with a digit.
        return !rest.is_empty()
            && rest.split('.').all(|element| {
                !element.is_empty()
                    && element
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            });
    }

    let mut elements = 0;
    for element in name.split('.') {
        elements += 1;
        let mut chars = element.chars();
        match chars.next() {
            Some(c) if is_element_start(c) || c == '-' => {}
            _ => return false,
        }
        if !chars.all(|c| is_element_char(c) || c == '-') {
            return false;
        }
    }
    elements >= 2
}

/// Check whether a string is a valid object path.
///
/// Paths are `/` or `/`-separated non-empty elements of `[A-Za-z0-9_]+`,
/// with no trailing slash.
pub fn is_object_path_valid(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    if rest.is_empty() {
        return false;
    }
    rest.split('/')
        .all(|element| !element.is_empty() && element.chars().all(is_element_char))
}

/// Check whether a string is a valid interface name: dot-separated with at
/// least two elements of `[A-Za-z_][A-Za-z0-9_]*`.
///
/// Error names share this grammar.
pub fn is_interface_name_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }
    let mut elements = 0;
    for element in name.split('.') {
        elements += 1;
        let mut chars = element.chars();
        match chars.next() {
            Some(c) if is_element_start(c) => {}
            _ => return false,
        }
        if !chars.all(is_element_char) {
            return false;
        }
    }
    elements >= 2
}

/// Check whether a string is a valid member (method or signal) name:
/// a single element of `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_member_name_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if is_element_start(c) => {}
        _ => return false,
    }
    chars.all(is_element_char)
}

/// Validate a bus name, returning an error describing the offending string.
pub fn assert_bus_name_valid(name: &str) -> Result<(), InvalidBusNameError> {
    if is_bus_name_valid(name) {
        Ok(())
    } else {
        Err(InvalidBusNameError(name.to_string()))
    }
}

/// Validate an object path.
pub fn assert_object_path_valid(path: &str) -> Result<(), InvalidObjectPathError> {
    if is_object_path_valid(path) {
        Ok(())
    } else {
        Err(InvalidObjectPathError(path.to_string()))
    }
}

/// Validate an interface (or error) name.
pub fn assert_interface_name_valid(name: &str) -> Result<(), InvalidInterfaceNameError> {
    if is_interface_name_valid(name) {
        Ok(())
    } else {
        Err(InvalidInterfaceNameError(name.to_string()))
    }
}

/// Validate a member name.
pub fn assert_member_name_valid(name: &str) -> Result<(), InvalidMemberNameError> {
    if is_member_name_valid(name) {
        Ok(())
    } else {
        Err(InvalidMemberNameError(name.to_string()))
    }
}
