/// Fixed response substituted for every blocked request.
///
/// The content never varies by block reason; reasons are logged only.
pub const BLOCK_RESPONSE: &[u8] = b"HTTP/1.0 403 Forbidden\r\n\
Content-Type: text/html\r\n\
Connection: close\r\n\
\r\n\
<html>\
<head><title>Action Not Allowed</title></head>\
<body>\
<h1>Action Not Allowed</h1>\
This request has been blocked by the firewall shim. \
Please contact your network administrator for more details.\
</body>\
</html>";
