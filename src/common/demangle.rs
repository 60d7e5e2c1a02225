//! Recognition of C++ constructor and vtable symbols.
//!
//! The passes need just enough of the Itanium mangling to answer two
//! questions: "is this function a constructor?" and "is this global a
//! vtable?". A full demangler is not required; nested-name parsing of
//! `_ZN...E` with the `C<n>` constructor tokens covers constructor symbols,
//! and vtables are `_ZTV`-prefixed. Unmangled names are matched against the
//! `Class::Class(...)` shape directly.

use regex::Regex;
use std::sync::OnceLock;

/// `Outer::Inner::Name(args)` with the scope chain captured. The constructor
/// test compares the last two path segments itself (the regex engine has no
/// backreferences).
fn ctor_shape() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:[A-Za-z_][A-Za-z0-9_]*::)*([A-Za-z_][A-Za-z0-9_]*)::([A-Za-z_~][A-Za-z0-9_]*)\(.*\)$").unwrap()
    })
}

/// Best-effort demangle of a nested Itanium name. Constructor tokens become
/// a repetition of the enclosing class name; anything unparsable is returned
/// verbatim.
pub fn demangle(name: &str) -> String {
    let Some(rest) = name.strip_prefix("_ZN") else {
        return name.to_string();
    };
    let bytes = rest.as_bytes();
    let mut pos = 0usize;
    let mut segments: Vec<String> = Vec::new();
    loop {
        if pos >= bytes.len() {
            return name.to_string();
        }
        match bytes[pos] {
            b'E' => break,
            b'0'..=b'9' => {
                let mut len = 0usize;
                while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                    len = len * 10 + (bytes[pos] - b'0') as usize;
                    pos += 1;
                }
                if pos + len > bytes.len() || len == 0 {
                    return name.to_string();
                }
                segments.push(rest[pos..pos + len].to_string());
                pos += len;
            }
            b'C' => {
                // C0..C3: constructor of the enclosing class.
                if pos + 1 >= bytes.len() || !bytes[pos + 1].is_ascii_digit() {
                    return name.to_string();
                }
                match segments.last() {
                    Some(class) => segments.push(class.clone()),
                    None => return name.to_string(),
                }
                pos += 2;
            }
            b'D' => {
                // D0..D2: destructor.
                if pos + 1 >= bytes.len() || !bytes[pos + 1].is_ascii_digit() {
                    return name.to_string();
                }
                match segments.last() {
                    Some(class) => segments.push(format!("~{class}")),
                    None => return name.to_string(),
                }
                pos += 2;
            }
            _ => return name.to_string(),
        }
    }
    if segments.is_empty() {
        return name.to_string();
    }
    // Parameter types are not decoded; "(...)" is enough for shape matching.
    format!("{}(...)", segments.join("::"))
}

/// True when `name` (mangled or not) denotes a constructor `C::C(...)`.
pub fn is_constructor(name: &str) -> bool {
    let demangled = demangle(name);
    let Some(caps) = ctor_shape().captures(&demangled) else {
        return false;
    };
    caps.get(1).map(|m| m.as_str()) == caps.get(2).map(|m| m.as_str())
}

/// True when `name` denotes a vtable global.
pub fn is_vtable_symbol(name: &str) -> bool {
    name.starts_with("_ZTV") || name.contains("vtable")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demangles_simple_ctor() {
        assert_eq!(demangle("_ZN1AC1Ev"), "A::A(...)");
        assert_eq!(demangle("_ZN3Foo3BarC2Ei"), "Foo::Bar::Bar(...)");
    }

    #[test]
    fn passes_through_unmangled() {
        assert_eq!(demangle("main"), "main");
        assert_eq!(demangle("_Znot_a_name"), "_Znot_a_name");
    }

    #[test]
    fn recognizes_constructors() {
        assert!(is_constructor("_ZN1AC1Ev"));
        assert!(is_constructor("_ZN3Foo3BarC2Ei"));
        assert!(is_constructor("Counter::Counter(int)"));
        assert!(!is_constructor("_ZN1A1mEv"));
        assert!(!is_constructor("Counter::increment(int)"));
        assert!(!is_constructor("main"));
        // Destructor is not a constructor.
        assert!(!is_constructor("_ZN1AD1Ev"));
    }

    #[test]
    fn recognizes_vtables() {
        assert!(is_vtable_symbol("_ZTV1A"));
        assert!(is_vtable_symbol("vtable_for_A"));
        assert!(!is_vtable_symbol("_ZN1AC1Ev"));
    }
}
