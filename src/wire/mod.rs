mod header;
mod message;
#[cfg(test)]
mod test;

pub(crate) use self::{
    header::new_request_id,
    message::{expected_message_length, Message, MAX_MESSAGE_SIZE},
};
