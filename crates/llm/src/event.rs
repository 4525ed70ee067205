/// Provider-agnostic stream event, already de-duplicated and ordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Text(String),
    Reasoning(String),
    /// `index` counts distinct images emitted in this turn, starting at zero.
    Image {
        url: String,
        is_final: bool,
        index: usize,
    },
    Done,
}
