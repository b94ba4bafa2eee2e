//! MAP SMS Operations Encoding
//!
//! MO-ForwardSM and MT-ForwardSM share the argument layout:
//! `SEQUENCE { sm-RP-DA, sm-RP-OA, sm-RP-UI OCTET STRING, moreMessagesToSend NULL OPTIONAL, ... }`.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use smsc_core::{Address, Message, Origin, DEFAULT_VALIDITY_SECS};

use super::encoding::{self, CharacterSet};
use super::tpdu::{self, SmsDeliver, SmsSubmit, UserData, ValidityPeriod};
use super::SmsOperation;
use crate::errors::{EncodingError, MapError};
use crate::tcap::asn1::{self, tag};
use crate::types::{SmRpDa, SmRpOa};

mod rp_tag {
    pub const IMSI: u8 = 0x80;
    pub const LMSI: u8 = 0x81;
    pub const MSISDN: u8 = 0x82;
    pub const SERVICE_CENTRE_ADDRESS: u8 = 0x84;
    pub const NONE: u8 = 0x85;
}

/// Argument of MO-ForwardSM and MT-ForwardSM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSmArg {
    pub sm_rp_da: SmRpDa,
    pub sm_rp_oa: SmRpOa,
    /// Encoded SMS-SUBMIT (MO) or SMS-DELIVER (MT)
    pub sm_rp_ui: Bytes,
    pub more_messages_to_send: bool,
}

impl ForwardSmArg {
    pub fn encode(&self) -> Result<Bytes, MapError> {
        let mut content = BytesMut::with_capacity(self.sm_rp_ui.len() + 32);

        match &self.sm_rp_da {
            SmRpDa::Imsi(imsi) => {
                asn1::encode_tagged(&mut content, rp_tag::IMSI, &tpdu::encode_tbcd(imsi)?)
            }
            SmRpDa::Lmsi(lmsi) => asn1::encode_tagged(&mut content, rp_tag::LMSI, lmsi),
            SmRpDa::ServiceCentreAddress(address) => asn1::encode_tagged(
                &mut content,
                rp_tag::SERVICE_CENTRE_ADDRESS,
                &encode_address_string(address)?,
            ),
            SmRpDa::NoSmRpDa => asn1::encode_tagged(&mut content, rp_tag::NONE, &[]),
        }

        match &self.sm_rp_oa {
            SmRpOa::Msisdn(address) => asn1::encode_tagged(
                &mut content,
                rp_tag::MSISDN,
                &encode_address_string(address)?,
            ),
            SmRpOa::ServiceCentreAddress(address) => asn1::encode_tagged(
                &mut content,
                rp_tag::SERVICE_CENTRE_ADDRESS,
                &encode_address_string(address)?,
            ),
            SmRpOa::NoSmRpOa => asn1::encode_tagged(&mut content, rp_tag::NONE, &[]),
        }

        asn1::encode_tagged(&mut content, tag::OCTET_STRING, &self.sm_rp_ui);
        if self.more_messages_to_send {
            asn1::encode_tagged(&mut content, tag::NULL, &[]);
        }

        let mut buf = BytesMut::with_capacity(content.len() + 4);
        asn1::encode_tagged(&mut buf, tag::SEQUENCE, &content);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, MapError> {
        let (sequence, _) = asn1::read_tlv(data)?;
        let sequence = sequence.expect(tag::SEQUENCE)?;
        let mut items = asn1::iter(sequence.value);

        let da = next_item(&mut items, "sm-RP-DA")?;
        let sm_rp_da = match da.tag {
            rp_tag::IMSI => SmRpDa::Imsi(tpdu::decode_tbcd(da.value)?),
            rp_tag::LMSI => SmRpDa::Lmsi(da.value.to_vec()),
            rp_tag::SERVICE_CENTRE_ADDRESS => {
                SmRpDa::ServiceCentreAddress(decode_address_string(da.value)?)
            }
            rp_tag::NONE => SmRpDa::NoSmRpDa,
            other => return Err(MapError::Malformed(format!("sm-RP-DA tag 0x{:02X}", other))),
        };

        let oa = next_item(&mut items, "sm-RP-OA")?;
        let sm_rp_oa = match oa.tag {
            rp_tag::MSISDN => SmRpOa::Msisdn(decode_address_string(oa.value)?),
            rp_tag::SERVICE_CENTRE_ADDRESS => {
                SmRpOa::ServiceCentreAddress(decode_address_string(oa.value)?)
            }
            rp_tag::NONE => SmRpOa::NoSmRpOa,
            other => return Err(MapError::Malformed(format!("sm-RP-OA tag 0x{:02X}", other))),
        };

        let ui = next_item(&mut items, "sm-RP-UI")?;
        if ui.tag != tag::OCTET_STRING {
            return Err(MapError::Malformed(format!("sm-RP-UI tag 0x{:02X}", ui.tag)));
        }
        let sm_rp_ui = Bytes::copy_from_slice(ui.value);

        // Extension containers and the v3 IMSI may follow
        let mut more_messages_to_send = false;
        for item in items {
            if item?.tag == tag::NULL {
                more_messages_to_send = true;
            }
        }

        Ok(Self {
            sm_rp_da,
            sm_rp_oa,
            sm_rp_ui,
            more_messages_to_send,
        })
    }
}

fn next_item<'a>(items: &mut asn1::TlvIter<'a>, what: &str) -> Result<asn1::Tlv<'a>, MapError> {
    items
        .next()
        .transpose()?
        .ok_or_else(|| MapError::Malformed(format!("missing {}", what)))
}

/// AddressString: extension bit, nature of address, numbering plan, TBCD digits
pub fn encode_address_string(address: &Address) -> Result<Vec<u8>, EncodingError> {
    let mut out = vec![0x80 | ((address.ton & 0x07) << 4) | (address.npi & 0x0F)];
    out.extend(tpdu::encode_tbcd(&address.digits)?);
    Ok(out)
}

pub fn decode_address_string(data: &[u8]) -> Result<Address, EncodingError> {
    let (&first, digits) = data.split_first().ok_or(EncodingError::BufferTooShort)?;
    Ok(Address::new(
        (first >> 4) & 0x07,
        first & 0x0F,
        tpdu::decode_tbcd(digits)?,
    ))
}

/// Convert message content into TP-DCS and user data
///
/// IA5 and Latin-1 text is transcoded to GSM7, or to UCS2 when it has
/// characters outside the GSM alphabet.
pub fn user_data_for(message: &Message) -> Result<(u8, UserData), MapError> {
    let udhi = message.esm_class & 0x40 != 0;
    let split = |content: &[u8]| -> Result<UserData, MapError> {
        if udhi {
            UserData::with_header(content)
        } else {
            Ok(UserData::new(content.to_vec()))
        }
    };
    let user_data = split(&message.content)?;

    match message.data_coding {
        0x00 => Ok((
            0x00,
            UserData {
                body: user_data.body.iter().map(|b| b & 0x7F).collect(),
                ..user_data
            },
        )),
        0x01 | 0x03 => {
            let text: String = user_data.body.iter().map(|&b| b as char).collect();
            match encoding::encode_gsm7(&text) {
                Ok(septets) => Ok((
                    0x00,
                    UserData {
                        body: septets,
                        ..user_data
                    },
                )),
                Err(_) => Ok((
                    0x08,
                    UserData {
                        body: encoding::encode_ucs2(&text),
                        ..user_data
                    },
                )),
            }
        }
        dc => {
            let dcs = encoding::dcs_from_data_coding(dc);
            CharacterSet::from_dcs(dcs)?;
            Ok((dcs, user_data))
        }
    }
}

/// Convert TP-DCS and user data back into SMPP data coding and content
pub fn content_from(dcs: u8, user_data: &UserData) -> Result<(u8, Vec<u8>), MapError> {
    Ok((encoding::data_coding_from_dcs(dcs)?, user_data.to_content()))
}

/// Build the MT-ForwardSM argument delivering `message`
///
/// The recipient number is carried in sm-RP-DA as the subscriber identity;
/// the remote resolves it (no SRI-SM lookup is made).
pub fn mt_forward_sm(
    message: &Message,
    service_centre: &Address,
    now: DateTime<Utc>,
) -> Result<ForwardSmArg, MapError> {
    let (dcs, user_data) = user_data_for(message)?;
    let deliver = SmsDeliver {
        more_messages_to_send: false,
        status_report_indication: message.wants_receipt(),
        reply_path: message.esm_class & 0x80 != 0,
        originating_address: message.source.clone(),
        protocol_id: message.protocol_id,
        dcs,
        service_centre_timestamp: now,
        user_data,
    };
    Ok(ForwardSmArg {
        sm_rp_da: SmRpDa::Imsi(message.destination.digits.clone()),
        sm_rp_oa: SmRpOa::ServiceCentreAddress(service_centre.clone()),
        sm_rp_ui: deliver.encode()?,
        more_messages_to_send: false,
    })
}

/// Build the MO-ForwardSM argument submitting `message` to a remote SMSC
pub fn mo_forward_sm(
    message: &Message,
    service_centre: &Address,
    message_reference: u8,
) -> Result<ForwardSmArg, MapError> {
    let (dcs, user_data) = user_data_for(message)?;
    let submit = SmsSubmit {
        reject_duplicates: false,
        status_report_request: message.wants_receipt(),
        reply_path: message.esm_class & 0x80 != 0,
        message_reference,
        destination_address: message.destination.clone(),
        protocol_id: message.protocol_id,
        dcs,
        validity_period: Some(ValidityPeriod::relative_from_secs(message.validity_secs)),
        user_data,
    };
    Ok(ForwardSmArg {
        sm_rp_da: SmRpDa::ServiceCentreAddress(service_centre.clone()),
        sm_rp_oa: SmRpOa::Msisdn(message.source.clone()),
        sm_rp_ui: submit.encode()?,
        more_messages_to_send: false,
    })
}

/// Map an inbound ForwardSM invoke into a gateway message
pub fn inbound_message(
    operation: SmsOperation,
    arg: &ForwardSmArg,
    remote: &str,
    now: DateTime<Utc>,
) -> Result<Message, MapError> {
    let mut message = match operation {
        SmsOperation::MoForwardSm => {
            let sender = match &arg.sm_rp_oa {
                SmRpOa::Msisdn(address) => address.clone(),
                other => {
                    return Err(MapError::Malformed(format!(
                        "MO-ForwardSM without MSISDN: {:?}",
                        other
                    )))
                }
            };
            let submit = SmsSubmit::decode(&arg.sm_rp_ui)?;
            let (data_coding, content) = content_from(submit.dcs, &submit.user_data)?;
            let mut message = Message::new(sender, submit.destination_address.clone(), content);
            message.data_coding = data_coding;
            message.protocol_id = submit.protocol_id;
            message.validity_secs =
                tpdu::validity_secs(submit.validity_period.as_ref(), now, DEFAULT_VALIDITY_SECS);
            if submit.status_report_request {
                message.registered_delivery = 0x01;
            }
            if submit.user_data.header.is_some() {
                message.esm_class |= 0x40;
            }
            message
        }
        SmsOperation::MtForwardSm => {
            let recipient = match &arg.sm_rp_da {
                SmRpDa::Imsi(digits) => Address::international(digits.clone()),
                SmRpDa::ServiceCentreAddress(address) => address.clone(),
                other => {
                    return Err(MapError::Malformed(format!(
                        "MT-ForwardSM without recipient: {:?}",
                        other
                    )))
                }
            };
            let deliver = SmsDeliver::decode(&arg.sm_rp_ui)?;
            let (data_coding, content) = content_from(deliver.dcs, &deliver.user_data)?;
            let mut message = Message::new(deliver.originating_address.clone(), recipient, content);
            message.data_coding = data_coding;
            message.protocol_id = deliver.protocol_id;
            if deliver.user_data.header.is_some() {
                message.esm_class |= 0x40;
            }
            message
        }
    };

    message.origin = Origin::Sigtran;
    message.client_id = Some(remote.to_string());
    Ok(message)
}
