/// Serde adapter for prost enumeration fields.
///
/// prost stores enumerations as `i32`; in JSON they are written as the
/// upper-case variant name (`"DYNAMIC"`, `"CONTROLLER_SERVICE"`). The enum
/// must provide `as_str_name` and `from_str_name`.
///
/// Invoked next to the enum definition. Generates `mod $module` for use with
/// `#[serde(with = "...")]` on an `i32` field and `mod $module::repeated` for
/// a `Vec<i32>` field.
macro_rules! enum_name_serde {
    ($module:ident, $enum:ident) => {
        pub mod $module {
            use serde::de::Error as _;
            use serde::{Deserialize, Deserializer, Serializer};

            fn to_name(value: i32) -> Result<&'static str, String> {
                super::$enum::try_from(value)
                    .map(|v| v.as_str_name())
                    .map_err(|_| format!("unknown {} value {}", stringify!($enum), value))
            }

            fn from_name(name: &str) -> Result<i32, String> {
                super::$enum::from_str_name(name)
                    .map(i32::from)
                    .ok_or_else(|| format!("unknown {} '{}'", stringify!($enum), name))
            }

            pub fn serialize<S: Serializer>(value: &i32, serializer: S) -> Result<S::Ok, S::Error> {
                let name = to_name(*value).map_err(serde::ser::Error::custom)?;
                serializer.serialize_str(name)
            }

            pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
                let name = String::deserialize(deserializer)?;
                from_name(&name).map_err(D::Error::custom)
            }

            pub mod repeated {
                use serde::de::Error as _;
                use serde::ser::SerializeSeq;
                use serde::{Deserialize, Deserializer, Serializer};

                pub fn serialize<S: Serializer>(
                    values: &[i32],
                    serializer: S,
                ) -> Result<S::Ok, S::Error> {
                    let mut seq = serializer.serialize_seq(Some(values.len()))?;
                    for value in values {
                        let name = super::to_name(*value).map_err(serde::ser::Error::custom)?;
                        seq.serialize_element(name)?;
                    }
                    seq.end()
                }

                pub fn deserialize<'de, D: Deserializer<'de>>(
                    deserializer: D,
                ) -> Result<Vec<i32>, D::Error> {
                    Vec::<String>::deserialize(deserializer)?
                        .iter()
                        .map(|name| super::from_name(name).map_err(D::Error::custom))
                        .collect()
                }
            }
        }
    };
}
