use super::mpd::Representation;

/// Picks one representation per track from a `+`-separated list of ids,
/// e.g. `"137+140"`.
///
/// Ids that match nothing on a track fall back to the highest bandwidth
/// representation of that track.
#[derive(Debug, Clone, Default)]
pub struct FormatSelector {
    ids: Vec<String>,
}

impl FormatSelector {
    pub fn new(format: Option<&str>) -> Self {
        let ids = format
            .map(|f| {
                f.split('+')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self { ids }
    }

    /// `representations` must already be sorted by descending bandwidth.
    pub(crate) fn select<'a>(&self, representations: &'a [Representation]) -> Option<&'a Representation> {
        representations
            .iter()
            .find(|r| self.ids.iter().any(|id| *id == r.id))
            .or_else(|| representations.first())
    }
}
