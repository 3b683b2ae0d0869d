//! Tunables read once when a [`SegmentPool`](crate::SegmentPool) is created.

const ENV_PREFIX: &str = "SEGMENTA_";

#[derive(Clone, Debug)]
pub struct Options {
  /// Milliseconds a freed range waits before it is purged. 0 purges
  /// immediately, negative never purges.
  pub purge_delay: i64,
  /// How far each new purge request pushes an armed deadline.
  pub purge_extend_delay: i64,
  /// Purge by decommitting (true) or only resetting contents (false).
  pub purge_decommits: bool,
  pub eager_commit: bool,
  /// Number of initial segments per thread that are committed lazily when
  /// more than one thread is running.
  pub eager_commit_delay: usize,
  /// Abandoned segments inspected per reclaim attempt, clamped to 8..=1024.
  pub max_segment_reclaim: usize,
  /// Force a purge when a segment is abandoned instead of leaving it scheduled.
  pub abandoned_page_purge: bool,
  /// Guard pages after the segment info and at the segment end.
  pub secure: bool,
  /// Huge segments are parked ownerless right away and freed by whichever
  /// thread releases the page.
  pub huge_page_abandon: bool,
  /// Capacity of the pool's segment table.
  pub max_segments: usize,
}

impl Default for Options {
  fn default() -> Self {
    Self {
      purge_delay: 10,
      purge_extend_delay: 1,
      purge_decommits: true,
      eager_commit: true,
      eager_commit_delay: 1,
      max_segment_reclaim: 8,
      abandoned_page_purge: false,
      secure: cfg!(feature = "secure"),
      huge_page_abandon: false,
      max_segments: 1024,
    }
  }
}

impl Options {
  /// Defaults overridden by `SEGMENTA_<NAME>` environment variables.
  pub fn from_env() -> Self {
    Self::default().with_overrides(|name| std::env::var(name).ok())
  }

  pub(crate) fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
    let get = |name: &str| lookup(&format!("{ENV_PREFIX}{}", name.to_ascii_uppercase()));

    override_with(&mut self.purge_delay, "purge_delay", &get, parse_int);
    override_with(&mut self.purge_extend_delay, "purge_extend_delay", &get, parse_int);
    override_with(&mut self.purge_decommits, "purge_decommits", &get, parse_bool);
    override_with(&mut self.eager_commit, "eager_commit", &get, parse_bool);
    override_with(&mut self.eager_commit_delay, "eager_commit_delay", &get, parse_usize);
    override_with(&mut self.max_segment_reclaim, "max_segment_reclaim", &get, parse_usize);
    override_with(&mut self.abandoned_page_purge, "abandoned_page_purge", &get, parse_bool);
    override_with(&mut self.secure, "secure", &get, parse_bool);
    override_with(&mut self.huge_page_abandon, "huge_page_abandon", &get, parse_bool);
    override_with(&mut self.max_segments, "max_segments", &get, parse_usize);
    self
  }

  pub fn max_segment_reclaim(&self) -> usize {
    self.max_segment_reclaim.clamp(8, 1024)
  }

  pub(crate) fn purge_allowed(&self) -> bool {
    self.purge_delay >= 0
  }
}

fn override_with<T>(
  slot: &mut T,
  name: &str,
  get: &impl Fn(&str) -> Option<String>,
  parse: fn(&str) -> Option<T>,
) {
  let Some(raw) = get(name) else { return };
  match parse(raw.trim()) {
    Some(v) => *slot = v,
    None => log::warn!("option {name}: ignoring malformed value {raw:?}"),
  }
}

fn parse_bool(s: &str) -> Option<bool> {
  match s.to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Some(true),
    "0" | "false" | "no" | "off" => Some(false),
    _ => None,
  }
}

fn parse_int(s: &str) -> Option<i64> {
  s.parse().ok()
}

fn parse_usize(s: &str) -> Option<usize> {
  s.parse().ok()
}
