pub mod injector;
pub mod message;
pub mod names;
pub mod namespace;
pub mod permissions;
pub mod registry;
pub mod session;
pub mod uidindex;

// Internet Message Format
// aka RFC 822 - RFC 2822 - RFC 5322
#[allow(clippy::upper_case_acronyms)]
pub struct IMF<'a> {
    pub raw: &'a [u8],
    pub parsed: eml_codec::part::composite::Message<'a>,
}

impl<'a> TryFrom<&'a [u8]> for IMF<'a> {
    type Error = ();

    fn try_from(body: &'a [u8]) -> Result<IMF<'a>, ()> {
        let parsed = eml_codec::parse_message(body).or(Err(()))?.1;
        Ok(Self { raw: body, parsed })
    }
}
