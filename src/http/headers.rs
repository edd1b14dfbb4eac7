//! Header fields shared by [`Request`](super::Request) and
//! [`Response`](super::Response).

/// One `name: value` line. The name keeps the spelling it was added with.
#[derive(Debug, Clone)]
struct Field {
    name: String,
    value: String,
}

impl Field {
    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Ordered header fields, looked up by name without regard to case.
///
/// A name may repeat: `Cookie` on the way in, `Set-Cookie` and `Vary` on the
/// way out. Fields are written back in the order they were added.
///
/// ```
/// use switchyard::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Set-Cookie", "a=1");
/// headers.insert("set-cookie", "b=2");
/// headers.set("Content-Type", "application/json");
///
/// assert_eq!(headers.get("SET-COOKIE"), Some("a=1"));
/// assert_eq!(headers.get_all("Set-Cookie").count(), 2);
/// assert_eq!(headers.len(), 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    fields: Vec<Field>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Room for `capacity` fields; the parser sizes this from the raw count.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Add a field after any existing ones with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push(Field {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Leave exactly one `name` field, holding `value`.
    ///
    /// The field keeps the position of the first one it replaces, or goes to
    /// the end when `name` was absent.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let Some(first) = self.fields.iter().position(|f| f.is(&name)) else {
            self.fields.push(Field { name, value });
            return;
        };
        let mut index = 0;
        self.fields.retain(|f| {
            let keep = index <= first || !f.is(&name);
            index += 1;
            keep
        });
        self.fields[first] = Field { name, value };
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).next()
    }

    /// Every value of `name`, in the order added.
    pub fn get_all<'a, 'b>(&'a self, name: &'b str) -> impl Iterator<Item = &'a str> + use<'a, 'b> {
        self.fields
            .iter()
            .filter(move |f| f.is(name))
            .map(|f| f.value.as_str())
    }

    /// Drop every `name` field. `false` when there was none.
    pub fn remove(&mut self, name: &str) -> bool {
        let count = self.fields.len();
        self.fields.retain(|f| !f.is(name));
        self.fields.len() != count
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.is(name))
    }

    /// Number of fields, counting repeats.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|f| (f.name.as_str(), f.value.as_str()))
    }
}
