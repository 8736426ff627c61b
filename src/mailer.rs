use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Body, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, warn};

use crate::config::EmailConfig;
use crate::types::{Digest, Result};

/// Delivery seam for rendered digests.
#[async_trait]
pub trait DigestTransport: Send + Sync {
    async fn dispatch(&self, digest: &Digest) -> Result<()>;
}

/// Sends digests over authenticated SMTP with implicit TLS, the way most
/// relay providers expect on port 465.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
    receiver: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let sender: Mailbox = config.sender_email.parse()?;
        let receiver: Mailbox = config.receiver_email.parse()?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_server)?
            .port(config.smtp_port)
            .credentials(Credentials::new(
                config.sender_email.clone(),
                config.sender_password.clone(),
            ))
            .build();

        Ok(Self {
            transport,
            sender,
            receiver,
        })
    }

    /// Builds the multipart message: plain text and HTML as alternatives,
    /// with downloaded media inlined next to the HTML part.
    fn build_message(&self, digest: &Digest) -> Result<Message> {
        let mut related = MultiPart::related().singlepart(SinglePart::html(digest.html.clone()));

        for item in &digest.media {
            let content_type = match ContentType::parse(&item.content_type) {
                Ok(ct) => ct,
                Err(e) => {
                    warn!(
                        "Skipping attachment {} with unusable content type {:?}: {}",
                        item.content_id, item.content_type, e
                    );
                    continue;
                }
            };
            related = related.singlepart(
                Attachment::new_inline(item.content_id.clone())
                    .body(Body::new(item.data.clone()), content_type),
            );
        }

        let message = Message::builder()
            .from(self.sender.clone())
            .to(self.receiver.clone())
            .subject(digest.subject.clone())
            .multipart(
                MultiPart::alternative()
                    .singlepart(SinglePart::plain(digest.text.clone()))
                    .multipart(related),
            )?;

        Ok(message)
    }
}

#[async_trait]
impl DigestTransport for SmtpMailer {
    async fn dispatch(&self, digest: &Digest) -> Result<()> {
        // Messages are consumed by send, so every attempt builds a fresh one.
        let message = self.build_message(digest)?;
        let response = self.transport.send(message).await?;
        debug!("SMTP accepted {:?}: {:?}", digest.subject, response.code());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaItem;

    fn email_config(sender: &str, receiver: &str) -> EmailConfig {
        EmailConfig {
            smtp_server: "smtp.example.com".to_string(),
            smtp_port: 465,
            sender_email: sender.to_string(),
            sender_password: "secret".to_string(),
            receiver_email: receiver.to_string(),
        }
    }

    fn digest_with_media(media: Vec<MediaItem>) -> Digest {
        Digest {
            subject: "RSS update - blog - 1 new entries".to_string(),
            html: "<html><body><p>hi</p></body></html>".to_string(),
            text: "hi".to_string(),
            media,
        }
    }

    #[test]
    fn malformed_sender_address_is_rejected_up_front() {
        let result = SmtpMailer::new(&email_config("not-an-address", "to@example.com"));
        assert!(result.is_err());
    }

    #[test]
    fn malformed_receiver_address_is_rejected_up_front() {
        let result = SmtpMailer::new(&email_config("from@example.com", "also bad"));
        assert!(result.is_err());
    }

    #[test]
    fn message_nests_media_next_to_the_html_part() {
        let mailer =
            SmtpMailer::new(&email_config("from@example.com", "to@example.com")).unwrap();
        let digest = digest_with_media(vec![MediaItem {
            content_id: "img_0_deadbeef".to_string(),
            content_type: "image/png".to_string(),
            data: vec![1, 2, 3],
        }]);

        let message = mailer.build_message(&digest).unwrap();
        let rendered = String::from_utf8_lossy(&message.formatted()).to_string();

        assert!(rendered.contains("multipart/alternative"));
        assert!(rendered.contains("multipart/related"));
        assert!(rendered.contains("Content-ID: <img_0_deadbeef>"));
        assert!(rendered.contains("Subject: RSS update - blog - 1 new entries"));
    }

    #[test]
    fn unusable_content_type_drops_the_attachment_not_the_message() {
        let mailer =
            SmtpMailer::new(&email_config("from@example.com", "to@example.com")).unwrap();
        let digest = digest_with_media(vec![MediaItem {
            content_id: "img_0_deadbeef".to_string(),
            content_type: "definitely not a mime type".to_string(),
            data: vec![1, 2, 3],
        }]);

        let message = mailer.build_message(&digest).unwrap();
        let rendered = String::from_utf8_lossy(&message.formatted()).to_string();

        assert!(!rendered.contains("Content-ID"));
        assert!(rendered.contains("multipart/alternative"));
    }
}
