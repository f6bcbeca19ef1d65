//! Typed view over an image's metadata document.

use std::fmt;

use vhdkit_shared::errors::{VhdkitError, VhdkitResult};

use super::metadata::MetadataDocument;

/// Processor architecture recorded for an image.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    X86 = 0,
    Arm = 5,
    Ia64 = 6,
    Amd64 = 9,
    Arm64 = 0xC,
    /// Missing, unparsable, or unrecognized.
    Unknown = -1,
}

impl Architecture {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::X86,
            5 => Self::Arm,
            6 => Self::Ia64,
            9 => Self::Amd64,
            0xC => Self::Arm64,
            _ => Self::Unknown,
        }
    }

    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86 => "x86",
            Self::Arm => "arm",
            Self::Ia64 => "ia64",
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Four-part OS version of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ImageVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub spbuild: u32,
}

impl fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.spbuild
        )
    }
}

/// Read-only accessors over an image metadata document.
///
/// Required fields fail with `ParseFailure` when missing. `flags`,
/// `architecture`, `default_language` and `version` fall back instead of
/// failing.
#[derive(Debug, Clone, Copy)]
pub struct ImageMetadata<'a> {
    document: Option<&'a MetadataDocument>,
}

impl<'a> ImageMetadata<'a> {
    pub fn new(document: Option<&'a MetadataDocument>) -> Self {
        Self { document }
    }

    pub fn document(&self) -> Option<&'a MetadataDocument> {
        self.document
    }

    /// `INDEX` attribute of the image element.
    pub fn index(&self) -> VhdkitResult<u32> {
        let raw = self
            .document()
            .and_then(|doc| doc.attribute("/IMAGE", "INDEX"))
            .ok_or_else(|| missing("/IMAGE/@INDEX"))?;
        parse_number(raw, "/IMAGE/@INDEX")
    }

    pub fn name(&self) -> VhdkitResult<&'a str> {
        self.required("/IMAGE/NAME")
    }

    pub fn edition_id(&self) -> VhdkitResult<&'a str> {
        self.required("/IMAGE/WINDOWS/EDITIONID")
    }

    /// `FLAGS`, or the edition id when the image has none.
    ///
    /// An edition id of `ServerHyper` (any case) reads as `ServerHyperCore`.
    /// Empty when neither is present.
    pub fn flags(&self) -> String {
        if let Some(flags) = self.optional("/IMAGE/FLAGS") {
            return flags.to_string();
        }

        match self.optional("/IMAGE/WINDOWS/EDITIONID") {
            Some(edition) if edition.eq_ignore_ascii_case("serverhyper") => {
                "ServerHyperCore".to_string()
            }
            Some(edition) => edition.to_string(),
            None => String::new(),
        }
    }

    pub fn product_type(&self) -> VhdkitResult<&'a str> {
        self.required("/IMAGE/WINDOWS/PRODUCTTYPE")
    }

    pub fn installation_type(&self) -> VhdkitResult<&'a str> {
        self.required("/IMAGE/WINDOWS/INSTALLATIONTYPE")
    }

    pub fn description(&self) -> VhdkitResult<&'a str> {
        self.required("/IMAGE/DESCRIPTION")
    }

    /// Uncompressed size of the image in bytes.
    pub fn total_bytes(&self) -> VhdkitResult<u64> {
        let raw = self.required("/IMAGE/TOTALBYTES")?;
        parse_number(raw, "/IMAGE/TOTALBYTES")
    }

    pub fn architecture(&self) -> Architecture {
        self.optional("/IMAGE/WINDOWS/ARCH")
            .and_then(|raw| raw.trim().parse::<i32>().ok())
            .map_or(Architecture::Unknown, Architecture::from_code)
    }

    pub fn default_language(&self) -> Option<&'a str> {
        self.optional("/IMAGE/WINDOWS/LANGUAGES/DEFAULT")
    }

    /// Each component defaults to 0 independently.
    pub fn version(&self) -> ImageVersion {
        let part = |name: &str| {
            self.optional(&format!("/IMAGE/WINDOWS/VERSION/{name}"))
                .and_then(|raw| raw.trim().parse::<u32>().ok())
                .unwrap_or(0)
        };
        ImageVersion {
            major: part("MAJOR"),
            minor: part("MINOR"),
            build: part("BUILD"),
            spbuild: part("SPBUILD"),
        }
    }

    pub fn display_name(&self) -> VhdkitResult<&'a str> {
        self.required("/IMAGE/DISPLAYNAME")
    }

    pub fn display_description(&self) -> VhdkitResult<&'a str> {
        self.required("/IMAGE/DISPLAYDESCRIPTION")
    }

    fn optional(&self, path: &str) -> Option<&'a str> {
        self.document?.text(path)
    }

    fn required(&self, path: &str) -> VhdkitResult<&'a str> {
        self.optional(path).ok_or_else(|| missing(path))
    }
}

fn missing(path: &str) -> VhdkitError {
    VhdkitError::ParseFailure(format!("metadata has no {path}"))
}

fn parse_number<T: std::str::FromStr>(raw: &str, path: &str) -> VhdkitResult<T>
where
    T::Err: fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| VhdkitError::ParseFailure(format!("{path} is not a number ({raw:?}): {e}")))
}
