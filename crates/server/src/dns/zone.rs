//! Authoritative answer synthesis
//!
//! The zone engine is stateless: every answer is derived from the query name
//! alone, plus the challenge broker for `_acme-challenge` lookups. Labels
//! encode addresses (`203-0-113-7` is `203.0.113.7`, `2001-db8--1` is
//! `2001:db8::1`, `local` is loopback), the apex carries SOA/NS/CAA and an
//! optional CNAME delegate.
//!
//! Answers are tagged records rendered by the hickory serializer; CAA is the
//! one exception, emitted as TXT and rewritten on the wire by [`super::caa`].

use crate::acme::broker::{dns01_digest, ChallengeBroker, ChallengeKind};
use crate::dns::caa::convert_txt_to_caa;
use crate::replica;
use hickory_proto::error::ProtoError;
use hickory_proto::op::{Header, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{rdata, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::warn;

/// UDP payload ceiling; longer responses are truncated with TC set.
pub const MAX_PACKET: usize = 512;

/// Synthesized address records are effectively immutable.
const SYNTH_TTL: u32 = 7 * 24 * 60 * 60;

const NS_TTL: u32 = 604_800;
const CNAME_TTL: u32 = 300;
const CAA_TTL: u32 = 86_400;
const CHALLENGE_TTL: u32 = 60;

// SOA timers per RIPE-203.
const SOA_TTL: u32 = 86_400;
const SOA_SERIAL: u32 = 1;
const SOA_REFRESH: i32 = 86_400;
const SOA_RETRY: i32 = 7_200;
const SOA_EXPIRE: i32 = 3_600_000;
const SOA_MINIMUM: u32 = 3_600;

/// Authoritative responder for one zone.
pub struct ZoneAuthority {
    zone: String,
    origin: Name,
    nameserver: Name,
    cname: Option<Name>,
    broker: Arc<ChallengeBroker>,
    replica: Option<String>,
}

/// What one question synthesizes into.
struct Synthesis {
    rcode: ResponseCode,
    answers: Vec<Record>,
    authority_soa: bool,
    caa: bool,
}

impl Synthesis {
    fn rcode(rcode: ResponseCode) -> Self {
        Self {
            rcode,
            answers: Vec::new(),
            authority_soa: false,
            caa: false,
        }
    }

    fn answers(answers: Vec<Record>) -> Self {
        Self {
            rcode: ResponseCode::NoError,
            answers,
            authority_soa: false,
            caa: false,
        }
    }

    fn no_data() -> Self {
        Self {
            rcode: ResponseCode::NoError,
            answers: Vec::new(),
            authority_soa: true,
            caa: false,
        }
    }

    fn nxdomain() -> Self {
        Self {
            rcode: ResponseCode::NXDomain,
            answers: Vec::new(),
            authority_soa: true,
            caa: false,
        }
    }
}

impl ZoneAuthority {
    pub fn new(
        zone: &str,
        nameserver: &str,
        cname: Option<&str>,
        broker: Arc<ChallengeBroker>,
        replica: Option<String>,
    ) -> Result<Self, ProtoError> {
        let zone = zone.trim_end_matches('.').to_ascii_lowercase();
        let origin = Name::from_ascii(format!("{zone}."))?;
        let nameserver = Name::from_ascii(format!("{}.", nameserver.trim_end_matches('.')))?;
        let cname = cname
            .map(|c| Name::from_ascii(format!("{}.", c.trim_end_matches('.'))))
            .transpose()?;

        Ok(Self {
            zone,
            origin,
            nameserver,
            cname,
            broker,
            replica,
        })
    }

    /// Answer one datagram. `None` means the packet is dropped.
    pub async fn respond(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let message = match Message::from_vec(packet) {
            Ok(message) => message,
            Err(_) => {
                // Malformed beyond the header still gets a FormErr with the
                // caller's ID echoed, if the header itself is readable.
                let mut decoder = BinDecoder::new(packet);
                let header = Header::read(&mut decoder).ok()?;
                let reply = self.response_shell(&header, ResponseCode::FormErr);
                return self.finish(reply, false);
            }
        };
        let header = message.header().clone();

        if header.op_code() != OpCode::Query {
            let reply = self.response_shell(&header, ResponseCode::NotImp);
            return self.finish(reply, false);
        }

        let Some(query) = message.queries().first() else {
            let reply = self.response_shell(&header, ResponseCode::FormErr);
            return self.finish(reply, false);
        };

        let synthesis = self.answer(query).await;

        let mut reply = self.response_shell(&header, synthesis.rcode);
        reply.add_query(query.clone());
        for record in synthesis.answers {
            reply.add_answer(record);
        }
        if synthesis.authority_soa {
            reply.add_name_server(self.soa_record(self.origin.clone()));
        }
        self.finish(reply, synthesis.caa)
    }

    /// Serve one question per the truth table.
    async fn answer(&self, query: &Query) -> Synthesis {
        let qtype = query.query_type();
        if qtype == RecordType::ANY {
            return Synthesis::rcode(ResponseCode::NotImp);
        }

        let owner = query.name().clone();
        let qname = owner.to_ascii().to_ascii_lowercase();
        let qname = qname.trim_end_matches('.');

        let label = if qname == self.zone {
            ""
        } else if let Some(label) = qname
            .strip_suffix(&self.zone)
            .and_then(|rest| rest.strip_suffix('.'))
        {
            label
        } else {
            return Synthesis::rcode(ResponseCode::Refused);
        };

        if label.is_empty() {
            return self.answer_apex(owner, qtype);
        }

        if label == "_acme-challenge" && qtype == RecordType::TXT {
            return self.answer_challenge(owner).await;
        }

        if label.contains('.') {
            return Synthesis::nxdomain();
        }

        self.answer_address(owner, label, qtype)
    }

    fn answer_apex(&self, owner: Name, qtype: RecordType) -> Synthesis {
        match qtype {
            RecordType::SOA => Synthesis::answers(vec![self.soa_record(owner)]),
            RecordType::NS => Synthesis::answers(vec![Record::from_rdata(
                owner,
                NS_TTL,
                RData::NS(rdata::NS(self.nameserver.clone())),
            )]),
            RecordType::CAA => {
                // Block every CA but Let's Encrypt, and deny non-wildcard
                // issuance to frustrate quota exhaustion. Emitted as TXT for
                // the wire rewriter.
                let records = ["0 issue \";\"", "0 issuewild \"letsencrypt.org\""]
                    .into_iter()
                    .map(|value| {
                        Record::from_rdata(
                            owner.clone(),
                            CAA_TTL,
                            RData::TXT(rdata::TXT::new(vec![value.to_string()])),
                        )
                    })
                    .collect();
                Synthesis {
                    rcode: ResponseCode::NoError,
                    answers: records,
                    authority_soa: false,
                    caa: true,
                }
            }
            _ => match &self.cname {
                // Not RFC-compliant at the apex, but pragmatically deployed.
                Some(cname) => Synthesis::answers(vec![Record::from_rdata(
                    owner,
                    CNAME_TTL,
                    RData::CNAME(rdata::CNAME(cname.clone())),
                )]),
                None => Synthesis::nxdomain(),
            },
        }
    }

    async fn answer_challenge(&self, owner: Name) -> Synthesis {
        let mut values = self.broker.dns_authorizations(&self.zone);
        if let Some(peer) = &self.replica {
            for key_authorization in
                replica::probe(peer, ChallengeKind::Dns01, &self.zone).await
            {
                values.push(dns01_digest(&key_authorization));
            }
        }

        if values.is_empty() {
            return Synthesis::no_data();
        }

        let records = values
            .into_iter()
            .map(|value| {
                Record::from_rdata(
                    owner.clone(),
                    CHALLENGE_TTL,
                    RData::TXT(rdata::TXT::new(vec![value])),
                )
            })
            .collect();
        Synthesis::answers(records)
    }

    fn answer_address(&self, owner: Name, label: &str, qtype: RecordType) -> Synthesis {
        let v4: Option<Ipv4Addr> = if label == "local" {
            Some(Ipv4Addr::LOCALHOST)
        } else {
            label.replace('-', ".").parse().ok()
        };
        let v6: Option<Ipv6Addr> = if label == "local" {
            Some(Ipv6Addr::LOCALHOST)
        } else {
            label.replace('-', ":").parse().ok()
        };

        match qtype {
            RecordType::A if v4.is_some() => Synthesis::answers(vec![Record::from_rdata(
                owner,
                SYNTH_TTL,
                RData::A(rdata::A::from(v4.unwrap())),
            )]),
            RecordType::AAAA if v6.is_some() => Synthesis::answers(vec![Record::from_rdata(
                owner,
                SYNTH_TTL,
                RData::AAAA(rdata::AAAA::from(v6.unwrap())),
            )]),
            // The label names an address, just not in the requested family.
            _ if v4.is_some() || v6.is_some() => Synthesis::no_data(),
            _ => Synthesis::nxdomain(),
        }
    }

    /// Response header policy: copy ID, OpCode and RD; set QR and AA.
    fn response_shell(&self, request: &Header, rcode: ResponseCode) -> Message {
        let mut response = Message::new();
        response.set_id(request.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(request.op_code());
        response.set_authoritative(true);
        response.set_recursion_desired(request.recursion_desired());
        response.set_response_code(rcode);
        response
    }

    fn soa_record(&self, owner: Name) -> Record {
        Record::from_rdata(
            owner,
            SOA_TTL,
            RData::SOA(rdata::SOA::new(
                self.nameserver.clone(),
                self.nameserver.clone(),
                SOA_SERIAL,
                SOA_REFRESH,
                SOA_RETRY,
                SOA_EXPIRE,
                SOA_MINIMUM,
            )),
        )
    }

    fn finish(&self, message: Message, rewrite_caa: bool) -> Option<Vec<u8>> {
        let mut bytes = match message.to_vec() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode dns response");
                return None;
            }
        };
        if rewrite_caa {
            bytes = convert_txt_to_caa(&bytes);
        }
        if bytes.len() > MAX_PACKET {
            bytes.truncate(MAX_PACKET);
            bytes[2] |= 0x02; // TC
        }
        Some(bytes)
    }
}
