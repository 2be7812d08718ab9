use std::error::Error;
use std::fmt;

/// Display adapter that renders an error and its whole `source` chain
/// on a single line, for structured log fields.
pub struct CompactError<'e, E: ?Sized>(&'e E);

impl<E> fmt::Display for CompactError<'_, E>
where
    E: Error + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;

        let mut source = self.0.source();
        while let Some(cause) = source {
            write!(f, ": {cause}")?;
            source = cause.source();
        }
        Ok(())
    }
}

pub trait FmtCompact {
    fn fmt_compact(&self) -> CompactError<'_, Self>;
}

impl<E> FmtCompact for E
where
    E: Error + ?Sized,
{
    fn fmt_compact(&self) -> CompactError<'_, Self> {
        CompactError(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, snafu::Snafu)]
    #[snafu(display("outer"))]
    struct Outer {
        source: std::io::Error,
    }

    #[test]
    fn chains_sources() {
        let err = Outer {
            source: std::io::Error::other("inner"),
        };
        assert_eq!(err.fmt_compact().to_string(), "outer: inner");
    }
}
