use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use hickory_proto::op::Message;
use hickory_proto::rr::{RData, Record};

/// 记录类型在入口处一次性判定 / Record type decided once at ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerRecord {
    /// 记录所属域名，去掉结尾的点 / Owning name without the trailing dot.
    pub name: Arc<str>,
    pub data: RecordData,
}

impl AnswerRecord {
    pub fn a(name: &str, addr: Ipv4Addr) -> Self {
        Self {
            name: Arc::from(name),
            data: RecordData::A(addr),
        }
    }

    pub fn aaaa(name: &str, addr: Ipv6Addr) -> Self {
        Self {
            name: Arc::from(name),
            data: RecordData::Aaaa(addr),
        }
    }

    pub fn from_record(record: &Record) -> Self {
        let data = match record.data() {
            Some(RData::A(a)) => RecordData::A(a.0),
            Some(RData::AAAA(aaaa)) => RecordData::Aaaa(aaaa.0),
            _ => RecordData::Other,
        };
        let name = record.name().to_utf8();
        let name = name.strip_suffix('.').unwrap_or(&name);
        Self {
            name: Arc::from(name),
            data,
        }
    }

    #[inline]
    pub fn addr(&self) -> Option<IpAddr> {
        match self.data {
            RecordData::A(v4) => Some(IpAddr::V4(v4)),
            RecordData::Aaaa(v6) => Some(IpAddr::V6(v6)),
            RecordData::Other => None,
        }
    }
}

/// 一次 DNS 应答中的记录，保持原始顺序 / Records of one DNS answer, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnswerSet {
    records: Vec<AnswerRecord>,
}

impl AnswerSet {
    pub fn new(records: Vec<AnswerRecord>) -> Self {
        Self { records }
    }

    /// 只取 answer 段 / Only the answer section is considered.
    pub fn from_message(msg: &Message) -> Self {
        msg.answers().iter().map(AnswerRecord::from_record).collect()
    }

    pub fn records(&self) -> &[AnswerRecord] {
        &self.records
    }

    pub fn addresses(&self) -> impl Iterator<Item = (&AnswerRecord, IpAddr)> + '_ {
        self.records
            .iter()
            .filter_map(|record| record.addr().map(|addr| (record, addr)))
    }

    pub fn has_addresses(&self) -> bool {
        self.addresses().next().is_some()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FromIterator<AnswerRecord> for AnswerSet {
    fn from_iter<I: IntoIterator<Item = AnswerRecord>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::Name;
    use hickory_proto::rr::rdata::{A, AAAA, CNAME};
    use std::str::FromStr;

    #[test]
    fn message_answers_are_classified_in_order() {
        let mut msg = Message::new();
        let name = Name::from_str("Example.COM.").unwrap();
        let target = Name::from_str("cdn.example.net.").unwrap();
        msg.add_answer(Record::from_rdata(name.clone(), 300, RData::CNAME(CNAME(target.clone()))));
        msg.add_answer(Record::from_rdata(target.clone(), 300, RData::A(A(Ipv4Addr::new(1, 2, 3, 4)))));
        msg.add_answer(Record::from_rdata(
            target,
            300,
            RData::AAAA(AAAA(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1))),
        ));

        let answers = AnswerSet::from_message(&msg);
        assert_eq!(answers.len(), 3);
        assert_eq!(answers.records()[0].data, RecordData::Other);
        assert_eq!(&*answers.records()[0].name, "Example.COM");
        assert_eq!(
            answers.records()[1],
            AnswerRecord::a("cdn.example.net", Ipv4Addr::new(1, 2, 3, 4))
        );
        let addrs: Vec<IpAddr> = answers.addresses().map(|(_, addr)| addr).collect();
        assert_eq!(addrs.len(), 2);
        assert!(addrs[1].is_ipv6());
    }

    #[test]
    fn sets_without_addresses_are_detected() {
        assert!(!AnswerSet::default().has_addresses());
        assert!(AnswerSet::default().is_empty());
        let other = AnswerSet::new(vec![AnswerRecord {
            name: Arc::from("x"),
            data: RecordData::Other,
        }]);
        assert!(!other.has_addresses());
        assert!(!other.is_empty());
    }
}
