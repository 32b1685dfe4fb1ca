//! Template expansion with per-stream generator state.
//!
//! A template is literal text with `%{<generator>:<arg>}` occurrences, e.g.
//! `"host-%{num.range:1-100}"`. Each occurrence is bound by position to a
//! generator record of the current stream: the i-th occurrence expanded
//! after [`Expander::set_stream`] always uses the i-th record of that stream.
//! A record is parsed on first visit and reused afterwards, so ranges keep
//! advancing from one request of the stream to the next while two
//! occurrences within one request never share state.
//!
//! `%{<Attribute>}` (no argument, not a generator name) expands to an
//! attribute already expanded for the current request. `%%` is a literal `%`.
//!
//! # Example
//!
//! ```
//! use dhcperf::xlat::Expander;
//!
//! let mut expander = Expander::with_seed(1);
//! let mut values = Vec::new();
//! for _ in 0..3 {
//!     expander.set_stream(0)?;
//!     values.push(expander.expand("%{num.range:10-11}")?);
//! }
//! assert_eq!(values, ["10", "11", "10"]);
//! # Ok::<(), dhcperf::Error>(())
//! ```

pub mod generator;
pub mod range;

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::error::{Error, Result};

pub use generator::{Generator, GeneratorKind, GeneratorState, XlatRng};

/// How many requests may reuse the scratch request before it is rebuilt.
pub const DEFAULT_SCRATCH_MAX_USES: u32 = 10_000;

type Constructor = Box<dyn Fn(&str) -> Result<GeneratorState> + Send>;

/// One template occurrence of a stream. `state` is `None` until the
/// occurrence has been parsed successfully.
#[derive(Debug)]
pub struct GeneratorRecord {
    pub index: usize,
    pub name: String,
    pub state: Option<GeneratorState>,
}

/// Per-request scratch state: which stream and position is being expanded,
/// and the attributes expanded so far for attribute references.
#[derive(Debug, Default)]
struct ScratchRequest {
    stream: usize,
    position: usize,
    attributes: Vec<(String, String)>,
}

pub struct Expander {
    constructors: HashMap<String, Constructor>,
    streams: Vec<Vec<GeneratorRecord>>,
    scratch: ScratchRequest,
    scratch_uses: u32,
    scratch_max_uses: u32,
    scratch_rebuilds: u64,
    rng: XlatRng,
}

impl std::fmt::Debug for Expander {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut generators: Vec<&String> = self.constructors.keys().collect();
        generators.sort();
        f.debug_struct("Expander")
            .field("generators", &generators)
            .field("streams", &self.streams.len())
            .field("scratch", &self.scratch)
            .field("scratch_uses", &self.scratch_uses)
            .finish()
    }
}

impl Default for Expander {
    fn default() -> Self {
        Self::with_rng(XlatRng::from_entropy())
    }
}

impl Expander {
    /// An expander with the built-in generators and an entropy-seeded RNG.
    pub fn new() -> Self {
        Self::default()
    }

    /// An expander with the built-in generators and a fixed RNG seed.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(XlatRng::from_seed(seed))
    }

    fn with_rng(rng: XlatRng) -> Self {
        let mut expander = Self {
            constructors: HashMap::new(),
            streams: Vec::new(),
            scratch: ScratchRequest::default(),
            scratch_uses: 0,
            scratch_max_uses: DEFAULT_SCRATCH_MAX_USES,
            scratch_rebuilds: 0,
            rng,
        };
        expander.register_generator(generator::NUM_RANGE, generator::num_range);
        expander.register_generator(generator::IPADDR_RANGE, generator::ipaddr_range);
        expander.register_generator(generator::IPADDR_RAND, generator::ipaddr_rand);
        expander.register_generator(generator::ETHADDR_RANGE, generator::ethaddr_range);
        expander.register_generator(generator::ETHADDR_RAND, generator::ethaddr_rand);
        expander
    }

    /// Reseeds the random source.
    pub fn seed(&mut self, seed: u64) {
        self.rng = XlatRng::from_seed(seed);
    }

    pub fn set_scratch_max_uses(&mut self, max_uses: u32) {
        self.scratch_max_uses = max_uses.max(1);
    }

    /// Number of times the scratch request has been rebuilt.
    pub fn scratch_rebuilds(&self) -> u64 {
        self.scratch_rebuilds
    }

    /// Registers a generator under `name`, replacing any previous one.
    ///
    /// The constructor is called with the text after `:` the first time an
    /// occurrence is visited; the state it returns is kept for that
    /// occurrence from then on.
    pub fn register_generator<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&str) -> Result<GeneratorState> + Send + 'static,
    {
        if self
            .constructors
            .insert(name.to_string(), Box::new(constructor))
            .is_some()
        {
            debug!("Replaced generator {}", name);
        }
    }

    pub fn is_generator(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Starts expanding a request of stream `stream`: the next generator
    /// occurrence binds to record 0 of that stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocFailure`] if the stream table can't grow.
    pub fn set_stream(&mut self, stream: usize) -> Result<()> {
        if self.scratch_uses >= self.scratch_max_uses {
            self.scratch = ScratchRequest::default();
            self.scratch_uses = 0;
            self.scratch_rebuilds += 1;
            trace!("Rebuilt scratch request");
        }
        self.scratch_uses += 1;

        if stream >= self.streams.len() {
            let alloc_failure = || Error::AllocFailure(format!("stream table for stream {}", stream));
            let len = stream.checked_add(1).ok_or_else(alloc_failure)?;
            self.streams
                .try_reserve(len - self.streams.len())
                .map_err(|_| alloc_failure())?;
            self.streams.resize_with(len, Vec::new);
        }

        self.scratch.stream = stream;
        self.scratch.position = 0;
        self.scratch.attributes.clear();
        Ok(())
    }

    /// Tears down the generator records of a stream. A later
    /// [`set_stream`](Self::set_stream) starts it afresh.
    pub fn drop_stream(&mut self, stream: usize) {
        if let Some(records) = self.streams.get_mut(stream) {
            records.clear();
        }
    }

    pub fn num_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn records(&self, stream: usize) -> &[GeneratorRecord] {
        self.streams.get(stream).map_or(&[], Vec::as_slice)
    }

    /// Makes `value` available to `%{name}` references until the next
    /// [`set_stream`](Self::set_stream).
    pub fn set_attribute(&mut self, name: &str, value: &str) {
        let attributes = &mut self.scratch.attributes;
        match attributes
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => *existing = value.to_string(),
            None => attributes.push((name.to_string(), value.to_string())),
        }
    }

    /// Expands a template for the current stream.
    ///
    /// # Errors
    ///
    /// - [`Error::Template`] on an unterminated `%{`.
    /// - [`Error::UnknownGenerator`] for an unknown generator or attribute.
    /// - [`Error::BadRange`] if a generator argument doesn't parse.
    pub fn expand(&mut self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(percent) = rest.find('%') {
            out.push_str(&rest[..percent]);
            let after = &rest[percent + 1..];

            if let Some(tail) = after.strip_prefix('%') {
                out.push('%');
                rest = tail;
            } else if let Some(body) = after.strip_prefix('{') {
                let Some(close) = body.find('}') else {
                    return Err(Error::Template(format!(
                        "unterminated '%{{' in [{}]",
                        template
                    )));
                };
                let value = self.expand_occurrence(&body[..close])?;
                out.push_str(&value);
                rest = &body[close + 1..];
            } else {
                out.push('%');
                rest = after;
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Expands each attribute of a request of `stream` in order. Later
    /// attributes may reference earlier ones with `%{name}`.
    pub fn expand_attributes<'a, I>(&mut self, stream: usize, attributes: I) -> Result<Vec<(String, String)>>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.set_stream(stream)?;
        let mut expanded = Vec::new();
        for (name, template) in attributes {
            let value = self.expand(template)?;
            self.set_attribute(name, &value);
            expanded.push((name.to_string(), value));
        }
        Ok(expanded)
    }

    fn expand_occurrence(&mut self, body: &str) -> Result<String> {
        let (name, arg) = match body.split_once(':') {
            Some((name, arg)) => (name.trim(), Some(arg)),
            None => (body.trim(), None),
        };

        if !self.constructors.contains_key(name) {
            if arg.is_none()
                && let Some((_, value)) = self
                    .scratch
                    .attributes
                    .iter()
                    .find(|(attribute, _)| attribute.eq_ignore_ascii_case(name))
            {
                return Ok(value.clone());
            }
            return Err(Error::UnknownGenerator(name.to_string()));
        }

        let stream = self.scratch.stream;
        let position = self.scratch.position;
        self.scratch.position += 1;

        let Some(records) = self.streams.get_mut(stream) else {
            return Err(Error::Template(format!("no stream selected for {}", body)));
        };
        while records.len() <= position {
            records.push(GeneratorRecord {
                index: records.len(),
                name: name.to_string(),
                state: None,
            });
        }
        let record = &mut records[position];
        if record.name != name {
            debug!("Stream {} record {} now holds {}", stream, position, name);
            record.name = name.to_string();
            record.state = None;
        }

        if record.state.is_none() {
            let constructor = &self.constructors[name];
            let state = constructor(arg.unwrap_or("")).map_err(|error| {
                debug!("Failed to parse {}: {}", body, error);
                error
            })?;
            trace!("Stream {} record {}: {:?}", stream, position, state);
            record.state = Some(state);
        }

        match record.state.as_mut() {
            Some(state) => state.emit(&mut self.rng),
            None => Err(Error::Template(format!("unparsed occurrence {}", body))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expand_for(expander: &mut Expander, stream: usize, template: &str) -> String {
        expander.set_stream(stream).unwrap();
        expander.expand(template).unwrap()
    }

    #[test]
    fn test_two_ranges_in_one_template() {
        let mut expander = Expander::with_seed(0);
        let template = "%{num.range:10-12}-%{num.range:100-101}";

        let values: Vec<String> = (0..6)
            .map(|_| expand_for(&mut expander, 0, template))
            .collect();

        assert_eq!(values, ["10-100", "11-101", "12-100", "10-101", "11-100", "12-101"]);
        assert_eq!(expander.records(0).len(), 2);
        assert_eq!(expander.records(0)[0].index, 0);
        assert_eq!(expander.records(0)[1].index, 1);
    }

    #[test]
    fn test_streams_are_independent() {
        let mut expander = Expander::with_seed(0);
        let template = "%{ipaddr.range:10.0.0.1-10.0.0.9}";

        assert_eq!(expand_for(&mut expander, 0, template), "10.0.0.1");
        assert_eq!(expand_for(&mut expander, 2, template), "10.0.0.1");
        assert_eq!(expand_for(&mut expander, 0, template), "10.0.0.2");
        assert_eq!(expand_for(&mut expander, 2, template), "10.0.0.2");
        assert_eq!(expander.num_streams(), 3);
        assert!(expander.records(1).is_empty());
    }

    #[test]
    fn test_repeated_visits_keep_kind_and_bounds() {
        let mut expander = Expander::with_seed(0);
        for _ in 0..5 {
            expand_for(&mut expander, 0, "%{num.range:5-9}");
            let record = &expander.records(0)[0];
            assert_eq!(record.name, "num.range");
            match record.state {
                Some(GeneratorState::NumRange { min, max, .. }) => {
                    assert_eq!((min, max), (5, 9));
                }
                ref other => panic!("unexpected state {:?}", other),
            }
        }
    }

    #[test]
    fn test_literals_and_escapes() {
        let mut expander = Expander::with_seed(0);
        assert_eq!(expand_for(&mut expander, 0, "plain"), "plain");
        assert_eq!(expand_for(&mut expander, 0, "100%% sure"), "100% sure");
        assert_eq!(expand_for(&mut expander, 0, "50% off"), "50% off");
        assert_eq!(expand_for(&mut expander, 0, "trailing %"), "trailing %");
    }

    #[test]
    fn test_template_errors() {
        let mut expander = Expander::with_seed(0);
        expander.set_stream(0).unwrap();

        assert!(matches!(
            expander.expand("%{num.range:1-2"),
            Err(Error::Template(_))
        ));
        assert!(matches!(
            expander.expand("%{no.such:1}"),
            Err(Error::UnknownGenerator(_))
        ));
        assert!(matches!(
            expander.expand("%{num.range:9-1}"),
            Err(Error::BadRange(_))
        ));
    }

    #[test]
    fn test_bad_range_leaves_record_unparsed() {
        let mut expander = Expander::with_seed(0);
        expander.set_stream(0).unwrap();
        assert!(expander.expand("%{ethaddr.range:12345}").is_err());

        let record = &expander.records(0)[0];
        assert_eq!(record.name, "ethaddr.range");
        assert!(record.state.is_none());
    }

    #[test]
    fn test_attribute_references() {
        let mut expander = Expander::with_seed(0);
        let expanded = expander
            .expand_attributes(
                0,
                [
                    ("Client-Hardware-Address", "%{ethaddr.range:02:00:00:00:00:01-02:00:00:00:00:05}"),
                    ("Hostname", "host-%{client-hardware-address}"),
                ],
            )
            .unwrap();

        assert_eq!(expanded[0].1, "02:00:00:00:00:01");
        assert_eq!(expanded[1].1, "host-02:00:00:00:00:01");
        // Attribute references don't consume generator records.
        assert_eq!(expander.records(0).len(), 1);

        expander.set_stream(0).unwrap();
        assert!(matches!(
            expander.expand("%{Hostname}"),
            Err(Error::UnknownGenerator(_))
        ));
    }

    #[test]
    fn test_registered_generator() {
        let mut expander = Expander::with_seed(0);
        expander.register_generator("hex.seq", |arg: &str| {
            let mut value = u32::from_str_radix(arg, 16)
                .map_err(|_| Error::BadRange(format!("Invalid hex start [{}]", arg)))?;
            Ok(GeneratorState::custom(move |_: &mut XlatRng| -> Result<String> {
                let current = value;
                value = value.wrapping_add(1);
                Ok(format!("{:x}", current))
            }))
        });
        assert!(expander.is_generator("hex.seq"));

        assert_eq!(expand_for(&mut expander, 0, "%{hex.seq:fe}"), "fe");
        assert_eq!(expand_for(&mut expander, 0, "%{hex.seq:fe}"), "ff");
        assert_eq!(expand_for(&mut expander, 0, "%{hex.seq:fe}"), "100");
        assert_eq!(
            expander.records(0)[0].state.as_ref().map(GeneratorState::kind),
            Some(GeneratorKind::Custom)
        );
    }

    #[test]
    fn test_expand_without_stream() {
        let mut expander = Expander::with_seed(0);
        assert_eq!(expander.expand("no generators").unwrap(), "no generators");
        assert!(matches!(
            expander.expand("%{num.range:1-2}"),
            Err(Error::Template(_))
        ));
    }

    #[test]
    fn test_unreachable_stream_is_an_alloc_failure() {
        let mut expander = Expander::with_seed(0);
        assert_eq!(expand_for(&mut expander, 0, "%{num.range:1-9}"), "1");

        for stream in [usize::MAX, usize::MAX / 2] {
            assert!(matches!(
                expander.set_stream(stream),
                Err(Error::AllocFailure(_))
            ));
        }
        assert_eq!(expander.num_streams(), 1);
        assert_eq!(expand_for(&mut expander, 0, "%{num.range:1-9}"), "2");
    }

    #[test]
    fn test_drop_stream_resets_progress() {
        let mut expander = Expander::with_seed(0);
        assert_eq!(expand_for(&mut expander, 0, "%{num.range:1-9}"), "1");
        assert_eq!(expand_for(&mut expander, 0, "%{num.range:1-9}"), "2");

        expander.drop_stream(0);
        assert!(expander.records(0).is_empty());
        assert_eq!(expand_for(&mut expander, 0, "%{num.range:1-9}"), "1");
    }

    #[test]
    fn test_scratch_request_is_rebuilt() {
        let mut expander = Expander::with_seed(0);
        expander.set_scratch_max_uses(3);

        for _ in 0..10 {
            expander.set_stream(0).unwrap();
        }
        assert_eq!(expander.scratch_rebuilds(), 3);
    }

    #[test]
    fn test_ipaddr_rand_is_bounded_and_uniform() {
        let mut expander = Expander::with_seed(0x5eed);
        let mut counts = [0u32; 10];

        for _ in 0..10_000 {
            let value = expand_for(&mut expander, 0, "%{ipaddr.rand:10.0.0.1-10.0.0.10}");
            let address: std::net::Ipv4Addr = value.parse().unwrap();
            let octets = address.octets();
            assert_eq!(&octets[..3], &[10, 0, 0]);
            assert!((1..=10).contains(&octets[3]), "{} out of range", address);
            counts[usize::from(octets[3] - 1)] += 1;
        }

        assert!(counts.iter().all(|count| *count > 0));
        let expected = 1_000.0;
        let chi_square: f64 = counts
            .iter()
            .map(|count| {
                let delta = f64::from(*count) - expected;
                delta * delta / expected
            })
            .sum();
        // Critical value for 9 degrees of freedom at alpha = 0.01.
        assert!(chi_square < 21.666, "chi-square {}", chi_square);
    }

    #[test]
    fn test_seeded_expanders_agree() {
        let template = "%{ipaddr.rand:10.0.0.1-10.0.255.254} %{ethaddr.rand}";
        let mut first = Expander::with_seed(42);
        let mut second = Expander::with_seed(42);

        for _ in 0..20 {
            assert_eq!(
                expand_for(&mut first, 0, template),
                expand_for(&mut second, 0, template)
            );
        }
    }
}
