use smol_str::SmolStr;

/// A single `;name=value` (or flag-style `;name`) parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Param {
    pub name: SmolStr,
    pub value: Option<SmolStr>,
}

/// Ordered parameter list for URIs, header field values and Via headers.
///
/// Insertion order and the original casing of unknown parameter names are
/// preserved so a message round-trips byte-compatibly; lookup is ASCII
/// case-insensitive as RFC 3261 requires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Params(Vec<Param>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns the parameter value; `Some(None)` means a flag parameter.
    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.0
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| p.value.as_deref())
    }

    /// Returns the value of a `name=value` parameter, if present.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).flatten()
    }

    /// Returns true if a parameter of this name exists (flag or valued).
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Sets a parameter, replacing an existing one of the same name in place.
    pub fn set(&mut self, name: impl Into<SmolStr>, value: Option<SmolStr>) {
        let name = name.into();
        if let Some(existing) = self
            .0
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(&name))
        {
            existing.value = value;
        } else {
            self.0.push(Param { name, value });
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Param> {
        let idx = self.0.iter().position(|p| p.name.eq_ignore_ascii_case(name))?;
        Some(self.0.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.0.iter()
    }

    /// Parses a `;`-delimited parameter tail such as `;tag=abc;lr`.
    ///
    /// The input must not include the leading separator of the first
    /// parameter. Empty segments are skipped.
    pub fn parse(input: &str) -> Self {
        let mut params = Params::new();
        for segment in input.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            match segment.split_once('=') {
                Some((name, value)) => params.0.push(Param {
                    name: SmolStr::new(name.trim()),
                    value: Some(SmolStr::new(value.trim())),
                }),
                None => params.0.push(Param {
                    name: SmolStr::new(segment),
                    value: None,
                }),
            }
        }
        params
    }
}

impl std::fmt::Display for Params {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for param in &self.0 {
            match &param.value {
                Some(value) => write!(f, ";{}={}", param.name, value)?,
                None => write!(f, ";{}", param.name)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive_but_casing_is_kept() {
        let params = Params::parse("Tag=abc;LR");
        assert_eq!(params.value("tag"), Some("abc"));
        assert!(params.contains("lr"));
        assert_eq!(params.to_string(), ";Tag=abc;LR");
    }

    #[test]
    fn set_replaces_in_place() {
        let mut params = Params::parse("a=1;b=2");
        params.set("A", Some(SmolStr::new("9")));
        assert_eq!(params.to_string(), ";a=9;b=2");
    }

    #[test]
    fn flag_parameters_round_trip() {
        let params = Params::parse("lr");
        assert_eq!(params.get("lr"), Some(None));
        assert_eq!(params.to_string(), ";lr");
    }

    #[test]
    fn empty_segments_are_skipped() {
        let params = Params::parse(";;a=1;");
        assert_eq!(params.len(), 1);
    }
}
