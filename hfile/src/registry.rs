use {
    crate::{file::FileHandler, mode::Mode, stream::HFile},
    std::{
        collections::HashMap,
        fmt,
        io::{self, ErrorKind},
        sync::Arc,
    },
    tracing::debug,
};

/// Priority of the handlers built into the registry. Plugins use lower values.
pub const BUILTIN_PRIORITY: u32 = 2000;

/// Opens streams for one URL scheme.
pub trait SchemeHandler: Send + Sync {
    /// Opens `url`, which still carries its scheme prefix.
    ///
    /// `registry` is the registry that dispatched the call, so handlers that
    /// wrap another stream can open it through the same table.
    fn open(&self, registry: &Registry, url: &str, mode: &Mode) -> io::Result<HFile>;

    fn is_remote(&self, registry: &Registry, url: &str) -> bool;

    /// Name of the plugin that provides this handler.
    fn provider(&self) -> &str;

    fn priority(&self) -> u32;
}

/// Plugin entry point. Registers the plugin's handlers and returns its name.
pub type PluginInit = fn(&mut Registry) -> io::Result<&'static str>;

/// Table of scheme handlers used to open streams by URL.
pub struct Registry {
    schemes: HashMap<String, Arc<dyn SchemeHandler>>,
    plugins: Vec<&'static str>,
}

impl Default for Registry {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Creates a registry that only knows about local files.
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        let mut registry = Self {
            schemes: HashMap::new(),
            plugins: Vec::new(),
        };
        registry.add_scheme_handler("file", Arc::new(FileHandler));
        registry
    }

    /// Registers `handler` for `scheme`.
    ///
    /// If the scheme already has a handler, the one with the higher priority
    /// is kept. On equal priority the existing handler stays.
    #[inline]
    pub fn add_scheme_handler(&mut self, scheme: &str, handler: Arc<dyn SchemeHandler>) {
        let scheme = scheme.to_ascii_lowercase();
        if let Some(existing) = self.schemes.get(&scheme) {
            if existing.priority() >= handler.priority() {
                debug!(
                    scheme,
                    kept = existing.provider(),
                    ignored = handler.provider(),
                    "scheme handler not replaced"
                );
                return;
            }
            debug!(
                scheme,
                old = existing.provider(),
                new = handler.provider(),
                "scheme handler replaced"
            );
        } else {
            debug!(scheme, provider = handler.provider(), "scheme handler added");
        }
        self.schemes.insert(scheme, handler);
    }

    /// Runs a plugin entry point and records the plugin name it returns.
    ///
    /// Besides a [`PluginInit`], any closure works, e.g. one that registers a
    /// handler configured at runtime.
    #[inline]
    pub fn load_plugin<F>(&mut self, init: F) -> io::Result<()>
    where
        F: FnOnce(&mut Self) -> io::Result<&'static str>,
    {
        let name = init(self)?;
        debug!(plugin = name, "plugin loaded");
        self.plugins.push(name);
        Ok(())
    }

    #[must_use]
    #[inline]
    pub fn plugins(&self) -> &[&'static str] {
        &self.plugins
    }

    #[must_use]
    #[inline]
    pub fn handler(&self, scheme: &str) -> Option<&Arc<dyn SchemeHandler>> {
        self.schemes.get(&scheme.to_ascii_lowercase())
    }

    fn find_handler(&self, url: &str) -> io::Result<&Arc<dyn SchemeHandler>> {
        let scheme = scheme_of(url).unwrap_or("file");
        self.handler(scheme).ok_or_else(|| {
            io::Error::new(
                ErrorKind::Unsupported,
                format!("no handler for scheme {scheme:?} in {url:?}"),
            )
        })
    }

    /// Opens `url` with the handler registered for its scheme, or as a local
    /// file if it has none.
    #[inline]
    pub fn open(&self, url: &str, mode: &str) -> io::Result<HFile> {
        let mode = Mode::parse(mode)?;
        self.open_with_mode(url, &mode)
    }

    #[inline]
    pub fn open_with_mode(&self, url: &str, mode: &Mode) -> io::Result<HFile> {
        self.find_handler(url)?.open(self, url, mode)
    }

    /// Whether `url` refers to a remote resource. Unknown schemes count as remote.
    #[must_use]
    #[inline]
    pub fn is_remote(&self, url: &str) -> bool {
        self.find_handler(url)
            .map_or(true, |handler| handler.is_remote(self, url))
    }
}

impl fmt::Debug for Registry {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemes: Vec<_> = self
            .schemes
            .iter()
            .map(|(scheme, handler)| (scheme.as_str(), handler.provider(), handler.priority()))
            .collect();
        schemes.sort_unstable();
        f.debug_struct("Registry")
            .field("schemes", &schemes)
            .field("plugins", &self.plugins)
            .finish()
    }
}

/// Returns the scheme of `url`, if it has one.
///
/// Single-letter prefixes are treated as drive letters, not schemes.
#[must_use]
#[inline]
pub fn scheme_of(url: &str) -> Option<&str> {
    let (scheme, _) = url.split_once(':')?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() || scheme.len() < 2 {
        return None;
    }
    chars
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        .then_some(scheme)
}

/// Strips one of `scheme://localhost/`, `scheme:///` or `scheme:` from `url`.
///
/// The first two forms keep the leading `/` of the absolute path. A `url`
/// without the prefix is returned unchanged.
#[must_use]
#[inline]
pub fn strip_scheme<'a>(url: &'a str, scheme: &str) -> &'a str {
    let rest = url
        .get(..scheme.len())
        .filter(|prefix| prefix.eq_ignore_ascii_case(scheme))
        .and_then(|_| url.get(scheme.len()..))
        .and_then(|rest| rest.strip_prefix(':'));
    let Some(rest) = rest else {
        return url;
    };
    if let Some(path) = rest.strip_prefix("//localhost").filter(|p| p.starts_with('/')) {
        path
    } else if let Some(path) = rest.strip_prefix("//").filter(|p| p.starts_with('/')) {
        path
    } else {
        rest
    }
}
