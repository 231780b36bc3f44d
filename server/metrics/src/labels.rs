use std::borrow::Cow;

/// A label value that is safe to export (bounded cardinality).
#[derive(Clone, Debug)]
pub struct BoundedLabel(Cow<'static, str>);

impl BoundedLabel {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Debug, Default)]
pub struct LabelPolicy;

impl LabelPolicy {
    pub fn reason(&self, reason: &'static str) -> BoundedLabel {
        BoundedLabel(Cow::Borrowed(reason))
    }

    pub fn link(&self, link: &'static str) -> BoundedLabel {
        BoundedLabel(Cow::Borrowed(link))
    }
}
