use crate::any::TypeInfo;

#[derive(thiserror::Error, Debug)]
pub enum GlobalErrorKind {
    #[error(
        "\
        Default injector slot is occupied by a foreign value of type {actual}. \
        Another copy of the library or unrelated code wrote to the slot.\
        "
    )]
    Polluted { actual: TypeInfo },
}
