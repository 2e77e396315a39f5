use {
    derive_more::Display,
    fs_err::OpenOptions,
    std::{
        fmt,
        io::{self, ErrorKind},
    },
};

/// Direction(s) in which a stream may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Access {
    #[display("read-only")]
    ReadOnly,
    #[display("write-only")]
    WriteOnly,
    #[display("read-write")]
    ReadWrite,
}

impl Access {
    #[must_use]
    #[inline]
    pub fn can_read(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    #[must_use]
    #[inline]
    pub fn can_write(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

/// Parsed open mode string, e.g. `"r"`, `"wb"`, `"a+"`.
///
/// Only the access letters (`r`, `w`, `a`) and the modifiers `+` and `x`
/// are meaningful here; format letters such as `b` or `z` belong to
/// higher layers and are ignored.
#[derive(Clone, PartialEq, Eq)]
pub struct Mode {
    source: String,
    access: Access,
    create: bool,
    truncate: bool,
    append: bool,
    exclusive: bool,
}

impl Mode {
    #[inline]
    pub fn parse(mode: &str) -> io::Result<Self> {
        let plus = mode.contains('+');
        let exclusive = mode.contains('x');
        let (access, create, truncate, append) = if mode.contains('r') {
            (Access::ReadOnly, false, false, false)
        } else if mode.contains('w') {
            (Access::WriteOnly, true, true, false)
        } else if mode.contains('a') {
            (Access::WriteOnly, true, false, true)
        } else {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid open mode {mode:?}: expected one of `r`, `w` or `a`"),
            ));
        };
        Ok(Self {
            source: mode.to_owned(),
            access: if plus { Access::ReadWrite } else { access },
            create,
            truncate,
            append,
            exclusive,
        })
    }

    #[must_use]
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    #[must_use]
    #[inline]
    pub fn access(&self) -> Access {
        self.access
    }

    #[must_use]
    #[inline]
    pub fn create(&self) -> bool {
        self.create
    }

    #[must_use]
    #[inline]
    pub fn truncate(&self) -> bool {
        self.truncate
    }

    #[must_use]
    #[inline]
    pub fn append(&self) -> bool {
        self.append
    }

    #[must_use]
    #[inline]
    pub fn exclusive(&self) -> bool {
        self.exclusive
    }

    /// Options for opening a local file in this mode.
    #[must_use]
    #[inline]
    pub fn open_options(&self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options
            .read(self.access.can_read())
            .write(self.access.can_write() && !self.append)
            .append(self.append);
        if self.exclusive {
            options.create_new(true);
        } else {
            options.create(self.create).truncate(self.truncate);
        }
        options
    }
}

impl fmt::Debug for Mode {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mode({:?}, {})", self.source, self.access)
    }
}
