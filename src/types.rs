//! Query parameters.
//!
//! Values cross the driver boundary in PostgreSQL text format. Decoding of
//! result values is left to the caller; encoding parameters only needs the
//! canonical text rendering of each Rust type.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};

/// A parameter in text format; `None` is SQL NULL.
pub type Param = Option<String>;

/// Conversion into a text-format query parameter.
pub trait IntoParam {
    fn into_param(self) -> Param;
}

macro_rules! display_param {
    ($($ty:ty),* $(,)?) => {
        $(
            impl IntoParam for $ty {
                #[inline]
                fn into_param(self) -> Param {
                    Some(self.to_string())
                }
            }
        )*
    };
}

display_param!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, String, &str, &String);

impl IntoParam for bool {
    fn into_param(self) -> Param {
        // PostgreSQL's boolean input accepts t/f; it is also its output form.
        Some(if self { "t" } else { "f" }.to_string())
    }
}

impl<T: IntoParam> IntoParam for Option<T> {
    fn into_param(self) -> Param {
        self.and_then(IntoParam::into_param)
    }
}

impl IntoParam for NaiveDate {
    fn into_param(self) -> Param {
        Some(self.format("%Y-%m-%d").to_string())
    }
}

impl IntoParam for NaiveTime {
    fn into_param(self) -> Param {
        Some(self.format("%H:%M:%S%.f").to_string())
    }
}

impl IntoParam for NaiveDateTime {
    fn into_param(self) -> Param {
        Some(self.format("%Y-%m-%d %H:%M:%S%.f").to_string())
    }
}

impl<Tz: TimeZone> IntoParam for DateTime<Tz> {
    fn into_param(self) -> Param {
        Some(self.to_rfc3339())
    }
}

impl IntoParam for uuid::Uuid {
    fn into_param(self) -> Param {
        Some(self.hyphenated().to_string())
    }
}

/// Build a `Vec<Param>` from heterogeneous values.
///
/// ```
/// use pgmux::params;
///
/// let params = params![42, "alice", None::<i32>, true];
/// assert_eq!(params[0].as_deref(), Some("42"));
/// assert_eq!(params[2], None);
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::Param>::new()
    };
    ($($value:expr),+ $(,)?) => {
        vec![$($crate::IntoParam::into_param($value)),+]
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_scalar_params() {
        assert_eq!(42i32.into_param().as_deref(), Some("42"));
        assert_eq!((-7i64).into_param().as_deref(), Some("-7"));
        assert_eq!(1.5f64.into_param().as_deref(), Some("1.5"));
        assert_eq!(true.into_param().as_deref(), Some("t"));
        assert_eq!(false.into_param().as_deref(), Some("f"));
        assert_eq!("hello".into_param().as_deref(), Some("hello"));
    }

    #[test]
    fn test_null_params() {
        assert_eq!(None::<i32>.into_param(), None);
        assert_eq!(Some(3u8).into_param().as_deref(), Some("3"));
    }

    #[test]
    fn test_date_time_params() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(date.into_param().as_deref(), Some("2024-02-29"));

        let ts = date.and_hms_opt(13, 5, 9).unwrap();
        assert_eq!(ts.into_param().as_deref(), Some("2024-02-29 13:05:09"));

        let utc = Utc.from_utc_datetime(&ts);
        assert_eq!(utc.into_param().as_deref(), Some("2024-02-29T13:05:09+00:00"));
    }

    #[test]
    fn test_uuid_param() {
        let id = uuid::Uuid::nil();
        assert_eq!(
            id.into_param().as_deref(),
            Some("00000000-0000-0000-0000-000000000000")
        );
    }

    #[test]
    fn test_params_macro() {
        let empty = crate::params![];
        assert!(empty.is_empty());

        let mixed = crate::params![1, "two", None::<&str>, 4.0f32];
        assert_eq!(mixed.len(), 4);
        assert_eq!(mixed[1].as_deref(), Some("two"));
        assert_eq!(mixed[2], None);
    }
}
