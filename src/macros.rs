// LNP Node: node running lightning network protocol and generalized lightning
// channels.
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

/// Performs RPC call and extracts the expected reply variant, failing with
/// [`crate::Error::Transport`] on any other reply.
///
/// ```ignore
/// let invoice =
///     rpc_call!(self.transport, RpcMsg::GetInvoice(id) => RpcMsg::Invoice(invoice) => invoice)?;
/// ```
macro_rules! rpc_call {
    ($transport:expr, $request:expr => $reply:pat => $value:expr) => {
        rpc_call!($transport, $request, None => $reply => $value)
    };
    ($transport:expr, $request:expr, $timeout:expr => $reply:pat => $value:expr) => {{
        let request = $request;
        let method = request.method();
        match $transport.call(request, $timeout) {
            Ok($reply) => Ok($value),
            Ok(other) => Err($crate::Error::Transport(::ln_rpc::Error::UnexpectedReply(format!(
                "{} in reply to {}",
                other.method(),
                method
            )))),
            Err(err) => Err($crate::Error::from(err)),
        }
    }};
}
