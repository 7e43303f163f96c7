use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::{RData, Record};

/// Reply skeleton echoing the request: ID, opcode and question are copied,
/// the recursion-desired flag carries over and recursion-available is set.
pub fn reply_to(req: &Message) -> Message {
    let mut resp = Message::new();
    resp.set_id(req.id());
    resp.set_message_type(MessageType::Response);
    resp.set_op_code(req.op_code());
    resp.set_recursion_desired(req.recursion_desired());
    resp.set_recursion_available(true);
    resp.set_response_code(ResponseCode::NoError);
    resp.add_queries(req.queries().iter().cloned());

    resp
}

pub fn reply_with_code(req: &Message, code: ResponseCode) -> Message {
    let mut resp = reply_to(req);
    resp.set_response_code(code);

    resp
}

/// One-line question summary for request logs, e.g. "A foo.example.".
pub fn format_questions(req: &Message) -> String {
    req.queries()
        .iter()
        .map(|q| format!("{} {}", q.query_type(), q.name()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Answer summary for response logs: the address or target per record.
pub fn format_answers(answers: &[Record]) -> String {
    answers
        .iter()
        .map(|record| match record.data() {
            Some(RData::A(a)) => a.0.to_string(),
            Some(RData::AAAA(aaaa)) => aaaa.0.to_string(),
            Some(RData::CNAME(cname)) => cname.0.to_string(),
            Some(RData::HTTPS(https)) => https.0.target_name().to_string(),
            _ => record.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}
